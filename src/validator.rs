//! SQL safety gate.
//!
//! The primary judgment is an LLM audit returning a structured verdict. When
//! that call fails, returns garbage, or is disabled, a deterministic pattern
//! pipeline decides instead. The pipeline is pure and ordered, so the same
//! SQL always produces the same verdict, and it is deliberately conservative:
//! this gate fronts read-only analytics, not a general SQL console.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::llm::{self, LanguageModel};
use crate::schema::Discovery;

const AUDIT_SYSTEM: &str = "You are a SQL security auditor for a read-only analytics agent. \
Judge whether the given SQL is safe to execute: it must be a single read-only statement, \
must not touch system catalogs or privilege tables, and must not contain injection probes, \
timing attacks, or file access. Respond with JSON only.";

/// Outcome of the safety gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub safe: bool,
    pub reason: Option<String>,
}

impl Verdict {
    fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
        }
    }

    fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfidenceLevel::High => write!(f, "high"),
            ConfidenceLevel::Medium => write!(f, "medium"),
            ConfidenceLevel::Low => write!(f, "low"),
        }
    }
}

/// Wire format of the LLM judgment.
#[derive(Debug, Deserialize)]
struct LlmVerdict {
    is_safe: bool,
    #[serde(default)]
    security_issues: Vec<String>,
    confidence_level: ConfidenceLevel,
    #[serde(default)]
    explanation: Option<String>,
}

lazy_static::lazy_static! {
    /// Data-destroying or schema-altering statement keywords. `create` is
    /// handled separately so column names like `created_at` pass.
    static ref HARMFUL_KEYWORDS: Regex = Regex::new(
        r"(?i)\b(drop|delete|insert|update|truncate|alter|exec|execute|merge|replace)\b"
    ).unwrap();

    static ref CREATE_STATEMENT: Regex = Regex::new(
        r"(?i)\bcreate\s+(table|database|index|view|procedure|function|trigger|role|user|schema)\b"
    ).unwrap();

    static ref STARTS_WITH_QUERY: Regex = Regex::new(r"(?i)^\s*(select|with)\b").unwrap();

    /// (category, pattern) pairs checked in order. The category becomes the
    /// rejection reason so refinement knows what to avoid.
    static ref DANGEROUS_PATTERNS: Vec<(&'static str, Regex)> = vec![
        // system catalog and privilege tables
        ("system catalog access", Regex::new(r"(?i)\b(pg_shadow|pg_authid|pg_user_mapping|pg_roles)\b").unwrap()),
        ("system catalog access", Regex::new(r"(?i)\bmysql\.user\b").unwrap()),
        ("system catalog access", Regex::new(r"(?i)\b(sysobjects|syscolumns|sysusers|sysdatabases)\b").unwrap()),
        ("system catalog access", Regex::new(r"(?i)\b(dba_users|all_users|user_tab_privs)\b").unwrap()),
        ("system catalog access", Regex::new(r"(?i)\bv\$\w+").unwrap()),
        // procedural and command execution
        ("procedural execution", Regex::new(r"(?i)\bxp_cmdshell\b").unwrap()),
        ("procedural execution", Regex::new(r"(?i)\bsp_executesql\b").unwrap()),
        ("procedural execution", Regex::new(r"(?i)\bdbms_\w+").unwrap()),
        ("procedural execution", Regex::new(r"(?i)\butl_(file|http|tcp|smtp)\b").unwrap()),
        ("procedural execution", Regex::new(r"(?i)\bpg_read_(file|binary_file)\b").unwrap()),
        ("procedural execution", Regex::new(r"(?is)\bcopy\b.*\bprogram\b").unwrap()),
        // time-based blind injection probes
        ("time-based injection", Regex::new(r"(?i)\bpg_sleep\s*\(").unwrap()),
        ("time-based injection", Regex::new(r"(?i)\bwaitfor\s+delay\b").unwrap()),
        ("time-based injection", Regex::new(r"(?i)\bbenchmark\s*\(").unwrap()),
        ("time-based injection", Regex::new(r"(?i)\bsleep\s*\(").unwrap()),
        // file input and output
        ("file access", Regex::new(r"(?i)\binto\s+(outfile|dumpfile)\b").unwrap()),
        ("file access", Regex::new(r"(?i)\bload_file\s*\(").unwrap()),
        ("file access", Regex::new(r"(?i)\bload\s+data\b").unwrap()),
        // hex and binary escapes used to smuggle payloads
        ("binary escape", Regex::new(r"(?i)\b0x[0-9a-f]{8,}").unwrap()),
        ("binary escape", Regex::new(r"\\x[0-9a-fA-F]{2}").unwrap()),
        // classic injection idioms
        ("injection idiom", Regex::new(r"(?i)\bor\s+1\s*=\s*1\b").unwrap()),
        ("injection idiom", Regex::new(r"(?i)'\s*or\s+'[^']*'\s*=\s*'").unwrap()),
        ("injection idiom", Regex::new(r"(?is)\bunion\s+(all\s+)?select\b.*\b(password|passwd|secret)\b").unwrap()),
    ];
}

pub struct SafetyValidator {
    model: Arc<dyn LanguageModel>,
    use_llm: bool,
}

impl SafetyValidator {
    pub fn new(model: Arc<dyn LanguageModel>, use_llm: bool) -> Self {
        Self { model, use_llm }
    }

    /// Runs the gate. Never errors: an unreachable or incoherent LLM just
    /// means the deterministic pipeline decides.
    pub async fn validate(&self, sql: &str, discovery: &Discovery) -> Verdict {
        if self.use_llm {
            match self.llm_verdict(sql, discovery).await {
                Ok(verdict) => {
                    if !verdict.safe {
                        info!(reason = ?verdict.reason, "LLM safety audit blocked query");
                    }
                    return verdict;
                }
                Err(e) => {
                    warn!(error = %e, "LLM safety audit unavailable, using pattern analysis");
                }
            }
        }
        Self::pattern_verdict(sql)
    }

    async fn llm_verdict(&self, sql: &str, discovery: &Discovery) -> Result<Verdict> {
        let tables = discovery
            .catalog
            .keys()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let user = format!(
            "SQL to audit:\n{}\n\nTables known to the agent: {}\n\n\
             Respond with JSON only:\n\
             {{\"is_safe\": true|false, \"security_issues\": [\"...\"], \
             \"confidence_level\": \"high\"|\"medium\"|\"low\", \"explanation\": \"...\"}}",
            sql, tables
        );
        let raw = self.model.complete(AUDIT_SYSTEM, &user).await?;
        let verdict: LlmVerdict = llm::parse_structured(&raw)?;

        if verdict.is_safe {
            return Ok(Verdict::safe());
        }
        let mut reason = if verdict.security_issues.is_empty() {
            "flagged by safety audit".to_string()
        } else {
            verdict.security_issues.join("; ")
        };
        if let Some(explanation) = verdict.explanation {
            if !explanation.trim().is_empty() {
                reason.push_str(": ");
                reason.push_str(explanation.trim());
            }
        }
        reason.push_str(&format!(" (confidence: {})", verdict.confidence_level));
        Ok(Verdict::unsafe_because(reason))
    }

    /// Deterministic pattern pipeline, checked in a fixed order. Pure
    /// function of the SQL text.
    pub fn pattern_verdict(sql: &str) -> Verdict {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Verdict::unsafe_because("empty query");
        }

        if let Some(found) = HARMFUL_KEYWORDS.find(trimmed) {
            return Verdict::unsafe_because(format!(
                "harmful keyword '{}' is not allowed",
                found.as_str().to_lowercase()
            ));
        }
        if CREATE_STATEMENT.is_match(trimmed) {
            return Verdict::unsafe_because("CREATE statements are not allowed");
        }

        if !STARTS_WITH_QUERY.is_match(trimmed) {
            return Verdict::unsafe_because("only SELECT or WITH statements are permitted");
        }

        for (category, pattern) in DANGEROUS_PATTERNS.iter() {
            if pattern.is_match(trimmed) {
                return Verdict::unsafe_because(format!("{} detected", category));
            }
        }

        if trimmed.matches(';').count() > 1 {
            return Verdict::unsafe_because("multiple SQL statements are not allowed");
        }

        if trimmed.contains("/*") || trimmed.contains("--") || trimmed.contains('#') {
            return Verdict::unsafe_because("SQL comments are not allowed");
        }

        Verdict::safe()
    }
}

//! Query planner: decides how much expensive work a question actually needs.
//!
//! Fast deterministic heuristics classify each incoming question and emit an
//! [`ExecutionPlan`] that tells the orchestrator which pipeline stages to
//! skip. No I/O, no model calls — a total function over all string inputs.
//!
//! Cost strategy per class:
//! - greetings: skip everything, canned response;
//! - exact fact hits: the fact text is the answer verbatim;
//! - error/debug questions: full pipeline, context quality matters most;
//! - code requests: skip validation and rerank, the first retrieved chunk is
//!   usually adequate;
//! - generic-topic questions: answered from general knowledge, no retrieval;
//! - domain-marked questions: full pipeline;
//! - everything else: full pipeline at lower confidence.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::config::PlannerConfig;

/// Types of queries the planner can identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryType {
    Greeting,
    SimpleFact,
    CodeRequest,
    ErrorDebug,
    GenericTopic,
    DomainSpecific,
    Complex,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::Greeting => "greeting",
            QueryType::SimpleFact => "simple_fact",
            QueryType::CodeRequest => "code_request",
            QueryType::ErrorDebug => "error_debug",
            QueryType::GenericTopic => "generic_topic",
            QueryType::DomainSpecific => "domain_specific",
            QueryType::Complex => "complex",
        }
    }
}

/// Plan for how to handle a query: which expensive operations to skip and
/// what to use instead. Created fresh per query, never persisted.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub query_type: QueryType,
    pub skip_retrieval: bool,
    pub skip_validation: bool,
    pub skip_rerank: bool,
    pub skip_llm: bool,
    pub use_canned_response: bool,
    pub canned_key: Option<String>,
    /// How confident the planner is, in `[0, 1]`.
    pub confidence: f32,
    pub reason: String,
}

impl ExecutionPlan {
    fn full_pipeline(query_type: QueryType, confidence: f32, reason: &str) -> Self {
        Self {
            query_type,
            skip_retrieval: false,
            skip_validation: false,
            skip_rerank: false,
            skip_llm: false,
            use_canned_response: false,
            canned_key: None,
            confidence,
            reason: reason.to_string(),
        }
    }

    fn canned(canned_key: &str, reason: &str) -> Self {
        Self {
            query_type: QueryType::Greeting,
            skip_retrieval: true,
            skip_validation: true,
            skip_rerank: true,
            skip_llm: true,
            use_canned_response: true,
            canned_key: Some(canned_key.to_string()),
            confidence: 1.0,
            reason: reason.to_string(),
        }
    }

    /// True when every stage is skipped.
    pub fn skip_all(&self) -> bool {
        self.skip_retrieval && self.skip_validation && self.skip_rerank && self.skip_llm
    }
}

/// Estimated model calls avoided by a plan, relative to the full pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSavings {
    pub full_pipeline_calls: u32,
    pub avoided_calls: u32,
    pub remaining_calls: u32,
    pub savings_percent: f32,
}

static GREETING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^(hi|hello|hey|yo|sup|gm|gn|what'?s up)[\s!.,?]*$",
        r"(?i)^(how are you|how'?re you|how do you do)[\s!.,?]*$",
        r"(?i)^(good morning|good afternoon|good evening)[\s!.,?]*$",
        r"(?i)^(thanks|thank you|thx)[\s!.,?]*$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Negative numeric error codes like `-1021`.
static NEGATIVE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-\d{3,}\b").unwrap());

/// Thanks get their own canned reply.
static THANKS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(thanks|thank you|thx)[\s!.,?]*$").unwrap());

const CODE_INDICATORS: &[&str] = &[
    "how to",
    "how do i",
    "example",
    "sample",
    "code",
    "snippet",
    "implement",
    "write",
    "create",
    "build",
    "show me",
    "give me",
    "can you write",
    "python",
    "javascript",
    "rust",
];

const ERROR_INDICATORS: &[&str] = &[
    "error",
    "exception",
    "failed",
    "not working",
    "broken",
    "issue",
    "problem",
    "bug",
    "wrong",
    "incorrect",
    "traceback",
    "stack trace",
    "status code",
    "http",
    "400",
    "401",
    "403",
    "404",
    "429",
    "500",
];

pub struct QueryPlanner {
    domain_markers: Vec<String>,
    generic_markers: Vec<String>,
    greeting_reply: String,
    thanks_reply: String,
}

impl QueryPlanner {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            domain_markers: config
                .domain_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
            generic_markers: config
                .generic_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
            greeting_reply: config.greeting_reply.clone(),
            thanks_reply: config.thanks_reply.clone(),
        }
    }

    /// Create an execution plan for the query. First match wins.
    ///
    /// The caller may supply the result of an exact-fact lookup; a hit plans
    /// the fact text as the verbatim answer with no further work.
    pub fn plan(&self, query: &str, fact_hit: Option<&str>) -> ExecutionPlan {
        let query_clean = query.trim();
        if query_clean.is_empty() {
            return ExecutionPlan::canned("greeting", "empty query");
        }

        let query_lower = query_clean.to_lowercase();

        if self.is_greeting(query_clean) {
            let key = if THANKS_RE.is_match(query_clean) {
                "thanks"
            } else {
                "greeting"
            };
            return ExecutionPlan::canned(key, "detected greeting");
        }

        if fact_hit.is_some() {
            return ExecutionPlan {
                query_type: QueryType::SimpleFact,
                skip_retrieval: true,
                skip_validation: true,
                skip_rerank: true,
                skip_llm: true,
                use_canned_response: false,
                canned_key: None,
                confidence: 1.0,
                reason: "direct fact store match".to_string(),
            };
        }

        if self.is_error_debug(&query_lower) {
            // Full pipeline: retrieval context quality matters most here.
            return ExecutionPlan::full_pipeline(
                QueryType::ErrorDebug,
                1.0,
                "error/debugging query - full pipeline",
            );
        }

        if self.is_code_request(&query_lower) {
            return ExecutionPlan {
                query_type: QueryType::CodeRequest,
                skip_retrieval: false,
                skip_validation: true,
                skip_rerank: true,
                skip_llm: false,
                use_canned_response: false,
                canned_key: None,
                confidence: 0.9,
                reason: "code request - skip validation/rerank".to_string(),
            };
        }

        if self.is_generic_topic(&query_lower) {
            return ExecutionPlan {
                query_type: QueryType::GenericTopic,
                skip_retrieval: true,
                skip_validation: true,
                skip_rerank: true,
                skip_llm: false,
                use_canned_response: false,
                canned_key: None,
                confidence: 1.0,
                reason: "generic topic - answer from general knowledge".to_string(),
            };
        }

        if self.is_domain_specific(&query_lower) {
            return ExecutionPlan::full_pipeline(
                QueryType::DomainSpecific,
                1.0,
                "domain-specific - full pipeline",
            );
        }

        ExecutionPlan::full_pipeline(QueryType::Complex, 0.7, "complex question - full pipeline")
    }

    /// Canned response text for a plan's key.
    pub fn canned_response(&self, key: &str) -> &str {
        match key {
            "thanks" => &self.thanks_reply,
            _ => &self.greeting_reply,
        }
    }

    /// Estimated model calls avoided by the plan. The full pipeline costs
    /// roughly five calls: validation, rerank, and generation rounds.
    pub fn estimate_savings(&self, plan: &ExecutionPlan) -> PlanSavings {
        const FULL_PIPELINE_CALLS: u32 = 5;

        let avoided = if plan.skip_all() {
            FULL_PIPELINE_CALLS
        } else {
            let mut avoided = 0;
            if plan.skip_validation {
                avoided += 1;
            }
            if plan.skip_rerank {
                avoided += 1;
            }
            if plan.skip_llm {
                avoided += 1;
            }
            avoided
        };

        PlanSavings {
            full_pipeline_calls: FULL_PIPELINE_CALLS,
            avoided_calls: avoided,
            remaining_calls: FULL_PIPELINE_CALLS - avoided,
            savings_percent: avoided as f32 / FULL_PIPELINE_CALLS as f32 * 100.0,
        }
    }

    fn is_greeting(&self, query: &str) -> bool {
        GREETING_PATTERNS.iter().any(|re| re.is_match(query))
    }

    fn is_code_request(&self, query_lower: &str) -> bool {
        CODE_INDICATORS.iter().any(|ind| query_lower.contains(ind))
    }

    fn is_error_debug(&self, query_lower: &str) -> bool {
        ERROR_INDICATORS.iter().any(|ind| query_lower.contains(ind))
            || NEGATIVE_CODE_RE.is_match(query_lower)
    }

    fn is_generic_topic(&self, query_lower: &str) -> bool {
        // A domain marker always pins the question to the product.
        if self.is_domain_specific(query_lower) {
            return false;
        }
        self.generic_markers.iter().any(|m| query_lower.contains(m))
    }

    fn is_domain_specific(&self, query_lower: &str) -> bool {
        self.domain_markers.iter().any(|m| query_lower.contains(m))
    }
}

//! Adversarial code review.
//!
//! ## Components
//!
//! - [`findings`]: severities, findings and agent reports
//! - [`policy`]: risk tiers resolved from changed file paths
//! - [`adversarial`]: the bounded find/fix/verify convergence loop
//! - [`rules`]: review rules learned from recurring findings
//! - [`agents`]: review agents and the fix applier backed by the agent CLI
//!
//! ## Example
//!
//! ```
//! use shipwright::review::{RiskPolicy, Severity};
//!
//! let policy = RiskPolicy::parse(r#"
//! [[tiers]]
//! name = "high"
//! patterns = ["src/auth/**"]
//! max_iterations = 5
//! min_fix_severity = "medium"
//! agents = ["security"]
//!
//! [[tiers]]
//! name = "low"
//! patterns = ["docs/**"]
//! max_iterations = 1
//! min_fix_severity = "critical"
//! agents = ["code-quality"]
//! "#).unwrap();
//!
//! let resolved = policy.resolve(&["src/auth/login.rs".to_string()]);
//! assert_eq!(resolved.tier.name, "high");
//! assert_eq!(resolved.tier.min_fix_severity, Severity::Medium);
//!
//! // Files no tier claims fall into the lowest-risk tier.
//! assert_eq!(policy.tier_for_file("README.md").name, "low");
//! ```

pub mod adversarial;
pub mod agents;
pub mod findings;
pub mod policy;
pub mod rules;

pub use adversarial::{AdversarialLoop, AdversarialLoopResult, ExitReason, IterationRecord};
pub use findings::{AgentReport, ReviewFinding, Severity};
pub use policy::{RiskPolicy, RiskTier};
pub use rules::{ReviewRule, RuleStore};

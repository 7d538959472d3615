// Business Rules Engine - condition/action rules over ticket lifecycle events

mod actions;
mod conditions;
mod engine;

pub use actions::{ActionExecutor, ActionOutcome, ActionType, RuleAction};
pub use conditions::{resolve_path, rule_context, RuleCondition, RuleOperator};
pub use engine::{load_rules_file, BusinessRule, RuleExecution, RulesEngine};

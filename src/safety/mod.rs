pub mod rules;
pub mod validator;

pub use rules::SafetyRules;
pub use validator::{SafetyError, SafetyValidator};

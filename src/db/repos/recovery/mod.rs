pub mod incidents;
pub mod learned_actions;
pub mod rules;

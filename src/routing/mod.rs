mod matcher;
mod table;

pub use matcher::PathMatcher;
pub use table::RuleTable;

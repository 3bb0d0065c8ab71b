mod query_type;
mod classifier;
mod special;

pub use query_type::*;
pub use classifier::{QueryClassifier, SimpleClassifier, QueryInfo, TableName, get_sql};
pub use special::{parse_special_statement, SpecialStatement, KillRequest, KillTarget, KillType};

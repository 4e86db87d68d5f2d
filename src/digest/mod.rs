pub mod audit;
pub mod config;
pub mod history;
pub mod name_cache;
pub mod normalize;
pub mod orchestrator;
pub mod output;
pub mod paths;
pub mod summarize;
pub mod util;
pub mod warn;

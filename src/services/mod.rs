pub mod accounts;
pub mod capital;
pub mod data_engine;
pub mod executor;
pub mod grid;
pub mod indicator_engine;
pub mod precision;
pub mod profit;
pub mod strategy;

#[cfg(test)]
mod accounts_tests;
#[cfg(test)]
mod executor_tests;
#[cfg(test)]
mod indicator_engine_tests;

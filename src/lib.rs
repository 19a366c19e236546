pub mod cohort;
pub mod config;
pub mod engine;
pub mod evaluator;
pub mod experiment;
pub mod genome;
pub mod mutation;
pub mod promotion;
pub mod repository;
pub mod scheduler;
pub mod wallet;

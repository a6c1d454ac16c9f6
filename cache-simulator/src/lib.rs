// Cache Simulator Library

pub mod generator;
pub mod profile;
pub mod runner;
pub mod stats;

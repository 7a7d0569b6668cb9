// src/lib.rs

pub mod api;
pub mod app_state;
pub mod chunkstore;
pub mod config;
pub mod error;
pub mod service;

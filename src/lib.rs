//! Vigil — persistent autonomous agent runtime.
//!
//! An indefinitely iterating plan-execute-remember loop over a tiered LLM
//! router, layered memory (blob audit, vector store, scratch pad), budget
//! tracking with per-provider balances, and a self-healing self-update
//! protocol.

pub mod api;
pub mod budget;
pub mod config;
pub mod core;
pub mod exec;
pub mod listeners;
pub mod llm;
pub mod memory;
pub mod planner;
pub mod runtime;
pub mod safety;
pub mod selfupdate;
pub mod state;
pub mod tools;
pub mod types;

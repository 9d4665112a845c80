//! AI Image Generation Orchestrator
//!
//! This library provides the core of the pixelforge generation service:
//! tier-based admission control, credit accounting, and dispatch of
//! generation jobs to interchangeable AI backends with bounded retries.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod providers;
pub mod routes;
pub mod services;

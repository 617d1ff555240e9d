//! Offline audio-to-video rendering with a durable, single-flight job queue.
//!
//! Audio is decoded to mono `f32` samples, analysed one frame at a time,
//! rasterised into a numbered PNG sequence and muxed by an external encoder.
//! [`jobs::JobScheduler`] drives that pipeline for queued jobs and can hand the
//! finished video to a [`publish::Publisher`].

pub mod audio;
pub mod config;
pub mod encode;
pub mod error;
pub mod jobs;
pub mod publish;
pub mod render;

pub use error::{Error, Result};

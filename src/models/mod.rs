//! Core data models for the audio conversion service.
//!
//! These are transient, request-scoped values: the upload notification that
//! triggers a conversion and the metadata of the object it produces.

pub mod event;
pub mod object;

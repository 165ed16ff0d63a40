//! Jenkins job trigger adapter.
//!
//! Implements [`pipeline::JobTrigger`] with Jenkins' remote build API: fetch a
//! CSRF crumb when the server issues one, then `POST
//! job/{job}/buildWithParameters` with basic authentication. A `201 Created`
//! or `302 Found` answer confirms the build was queued; its `Location` header
//! is returned as the queue URL.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Transport, authentication and form encoding live here.
//! The [`pipeline`] crate sees only [`pipeline::JobTrigger`].

mod error;
mod trigger;

pub use error::JenkinsError;
pub use trigger::{build_form, job_path, JenkinsConfig, JenkinsJobTrigger, BUILD_NUMBER_PARAM};

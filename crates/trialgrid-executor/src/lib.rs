//! trialgrid-executor: runs task instances.
//!
//! # Architecture
//!
//! ```text
//!   TaskExecutor ──► ContainerRuntime (DockerEngine: unix socket + docker CLI)
//!        │   ├─ pull / build (BuildPlan) / run / stop
//!        │   └─ LiveMonitor ──► stats ──► hardware rows
//!        ├─► host process (sh -c) when the start policy allows it
//!        └─► StdoutReader ──► logs + output directives ──► JobStorage
//! ```
//!
//! Every state change of an instance goes through [`trialgrid_sync::JobStorage`]
//! as a typed patch; the executor never talks to the authority directly.

pub mod build;
pub mod docker;
pub mod environment;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod runtime;
pub mod stdout;
pub mod template;

pub use build::{BuildPlan, GENERATED_DOCKERFILE, image_tag, plan_build, synthesize_dockerfile};
pub use docker::{DEFAULT_SOCKET, DockerEngine};
pub use environment::{collect_environment, expand_bind, parse_env_vars};
pub use error::{ExecutorError, ExecutorResult};
pub use executor::{ExecutorConfig, TaskExecutor, cancelled};
pub use monitor::{LiveMonitor, hardware_file};
pub use runtime::{BuildSpec, ContainerRuntime, ContainerSpec, ContainerStats, ImageInfo, PullEvent};
pub use stdout::{Directive, StdoutReader, apply_directive, parse_directive};
pub use template::{TemplateContext, TemplateError, render, render_lenient};

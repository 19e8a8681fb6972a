//! Recipe evaluator for container-style VM image build recipes.
//!
//! `shipwright-recipe` turns a Dockerfile-grammar recipe into an ordered
//! [`Plan`] of executable steps: it reads the recipe text, splits it into
//! build stages, expands build arguments and environment variables, resolves
//! `ADD`/`COPY` sources into lazily-opened resources, and schedules the final
//! stage's instructions against a pluggable dependency exporter for
//! cross-stage `COPY --from=`.
//!
//! # Quick start
//!
//! ```no_run
//! # async fn run() -> shipwright_recipe::Result<()> {
//! use shipwright_recipe::{plan, reader, stage::Stages, planner::NoDependencies};
//! use shipwright_recipe::resource::RecipeOrigin;
//! use std::collections::BTreeMap;
//! use std::path::PathBuf;
//!
//! let instructions = reader::read("./Dockerfile").await?;
//! let stages = Stages::split(instructions)?;
//! let origin = RecipeOrigin::Local(PathBuf::from("."));
//! let built = plan(&stages, &origin, BTreeMap::new(), &NoDependencies, &[]).await?;
//! println!("{} steps", built.steps.len());
//! # Ok(())
//! # }
//! ```

mod env;
mod error;
mod instruction;
mod lexer;
pub mod planner;
pub mod reader;
pub mod resource;
pub mod stage;

pub use env::BuildEnv;
pub use error::{Error, ResolveError, Result};
pub use instruction::Instruction;
pub use planner::{plan, DependencyResolver, Plan, PlanStep, VmMetadata};
pub use resource::{Origin, RecipeOrigin, Resource};
pub use stage::{Stage, StageParent, Stages};

mod graph;
mod resolve;

pub use graph::DependencyGraph;
pub use resolve::{
    MissingDependency, Resolution, ResolveOptions, Resolver, SatisfiedRequirement,
    DEFAULT_IGNORED_PACKAGES,
};

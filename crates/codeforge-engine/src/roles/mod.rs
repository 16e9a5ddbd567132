//! The pipeline roles. Each role is a function over the container and the
//! LLM gateway; the container is mutated only by the currently active role.

pub mod coder;
pub mod designer;
pub mod researcher;
pub mod reviewer;

pub use coder::{Coder, CoderOutcome};
pub use designer::Designer;
pub use researcher::{ResearchOutcome, Researcher};
pub use reviewer::{Reviewer, ReviewReport, ToolReports};

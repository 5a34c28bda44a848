pub mod deck;
pub mod decisions;
pub mod error;
pub mod events;
pub mod providers;
pub mod summary;
pub mod templates;

pub use deck::{
    Claim, ContentSpec, DeckConstraints, EffectiveSlide, EffectiveSpec, SlideConstraints,
    SlideContent, SlideLimits, VisualRequest,
};
pub use decisions::{DecisionArena, DecisionLog, LayoutDecision, TextAdjustments};
pub use error::{ContractViolation, Violation};
pub use templates::{TemplateCatalog, TemplateProfile, CountRange, ZoneCapacities};

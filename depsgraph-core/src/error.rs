//! Errors surfaced at the public boundary.
//!
//! Only misuse of the façade is reported as an [`Error`]. Broken graph
//! invariants panic, and lookups inside the graph return `Option`.

use crate::scene::SessionUuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("scene {0:?} not found in document")]
    SceneNotFound(SessionUuid),

    #[error("datablock {0:?} is not a scene")]
    NotAScene(SessionUuid),

    #[error("view layer {name:?} not found in scene {scene:?}")]
    ViewLayerNotFound { scene: SessionUuid, name: String },

    #[error("datablock {0:?} not found in graph")]
    DatablockNotFound(SessionUuid),
}

pub type Result<T> = std::result::Result<T, Error>;

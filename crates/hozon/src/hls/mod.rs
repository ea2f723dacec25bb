pub mod decrypt;
pub mod manifest;
pub mod playlist;

pub use decrypt::HlsKey;
pub use manifest::{KeyDeclaration, MediaManifest};
pub use playlist::{resolve_playlist, ResolvedPlaylist};

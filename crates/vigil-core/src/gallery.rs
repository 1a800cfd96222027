//! Static identity gallery, loaded once at startup.

use crate::types::{Embedding, UNKNOWN_NAME};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read gallery {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid gallery snapshot: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("\"Unknown\" is reserved and cannot name a gallery identity")]
    ReservedName,
    #[error("identity name \"{0}\" appears more than once")]
    DuplicateName(String),
    #[error("identity id {0} appears more than once")]
    DuplicateId(Uuid),
    #[error("embedding for \"{name}\" has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// A known person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub reference_image: Option<PathBuf>,
    pub embedding: Embedding,
}

/// One identity as it appears in a gallery snapshot file. Entries without
/// an `id` are assigned one when the gallery is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference_image: Option<PathBuf>,
    pub embedding: Embedding,
}

/// Known identities as parallel arrays, indexed identically.
#[derive(Debug, Clone, Default)]
pub struct IdentityGallery {
    embeddings: Vec<Embedding>,
    names: Vec<String>,
    descriptions: Vec<String>,
    ids: Vec<Uuid>,
    reference_images: Vec<Option<PathBuf>>,
}

impl IdentityGallery {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from snapshot entries, minting an id for every entry that
    /// lacks one. Minted ids are unique against every id in the snapshot.
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        let mut taken: HashSet<Uuid> = HashSet::new();
        for id in entries.iter().filter_map(|e| e.id) {
            if !taken.insert(id) {
                return Err(GalleryError::DuplicateId(id));
            }
        }

        let mut identities = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = match entry.id {
                Some(id) => id,
                None => {
                    let id = mint_unique_id(&taken);
                    taken.insert(id);
                    tracing::debug!(name = %entry.name, %id, "assigned id to gallery entry");
                    id
                }
            };
            identities.push(Identity {
                id,
                name: entry.name,
                description: entry.description,
                reference_image: entry.reference_image,
                embedding: entry.embedding,
            });
        }

        Self::from_identities(identities)
    }

    pub fn from_identities(identities: Vec<Identity>) -> Result<Self, GalleryError> {
        let mut gallery = Self::empty();
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        let expected_dim = identities.first().map(|i| i.embedding.dim());

        for identity in identities {
            if identity.name == UNKNOWN_NAME {
                return Err(GalleryError::ReservedName);
            }
            if !names.insert(identity.name.clone()) {
                return Err(GalleryError::DuplicateName(identity.name));
            }
            if !ids.insert(identity.id) {
                return Err(GalleryError::DuplicateId(identity.id));
            }
            if let Some(expected) = expected_dim {
                if identity.embedding.dim() != expected {
                    return Err(GalleryError::DimensionMismatch {
                        name: identity.name,
                        expected,
                        actual: identity.embedding.dim(),
                    });
                }
            }

            gallery.embeddings.push(identity.embedding);
            gallery.names.push(identity.name);
            gallery.descriptions.push(identity.description);
            gallery.ids.push(identity.id);
            gallery.reference_images.push(identity.reference_image);
        }

        Ok(gallery)
    }

    /// Load a JSON array of [`GalleryEntry`] values.
    pub fn load_json(path: &Path) -> Result<Self, GalleryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| GalleryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<GalleryEntry> = serde_json::from_str(&raw)?;
        let gallery = Self::from_entries(entries)?;
        tracing::info!(path = %path.display(), identities = gallery.len(), "gallery loaded");
        Ok(gallery)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn descriptions(&self) -> &[String] {
        &self.descriptions
    }

    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }

    /// Stored id for a gallery name.
    pub fn id_for_name(&self, name: &str) -> Option<Uuid> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.ids[idx])
    }

    /// Reassemble the identity at `index`.
    pub fn identity(&self, index: usize) -> Option<Identity> {
        Some(Identity {
            id: *self.ids.get(index)?,
            name: self.names[index].clone(),
            description: self.descriptions[index].clone(),
            reference_image: self.reference_images[index].clone(),
            embedding: self.embeddings[index].clone(),
        })
    }

    pub fn identities(&self) -> impl Iterator<Item = Identity> + '_ {
        (0..self.len()).filter_map(|i| self.identity(i))
    }
}

/// Generate a v4 id not present in `taken`.
pub fn mint_unique_id(taken: &HashSet<Uuid>) -> Uuid {
    loop {
        let id = Uuid::new_v4();
        if !taken.contains(&id) {
            return id;
        }
        tracing::trace!(%id, "generated id collided; retrying");
    }
}

//! Voxel type registry
//!
//! The registry is built once at server startup and sent to every client in
//! `GameRegistryData`. Air is always id 0 so that a freshly allocated chunk is
//! empty space.

use crate::world::{VoxelId, AIR};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelDefinition {
    pub name: String,
    /// Whether players collide with the voxel.
    pub solid: bool,
    /// Texture name resolved by the renderer.
    pub texture: String,
}

impl VoxelDefinition {
    pub fn new(name: &str, solid: bool, texture: &str) -> Self {
        Self {
            name: name.to_string(),
            solid,
            texture: texture.to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate voxel name `{0}`")]
    DuplicateName(String),

    #[error("voxel registry is full")]
    Full,

    #[error("first voxel definition must be `air`, found `{0}`")]
    AirNotFirst(String),

    #[error("voxel registry is empty")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct VoxelRegistry {
    definitions: Vec<VoxelDefinition>,
    by_name: HashMap<String, VoxelId>,
}

impl VoxelRegistry {
    /// A registry holding only air.
    pub fn new() -> Self {
        let air = VoxelDefinition::new("air", false, "");
        let mut by_name = HashMap::new();
        by_name.insert(air.name.clone(), AIR);
        Self {
            definitions: vec![air],
            by_name,
        }
    }

    /// The voxel set the server ships with when no registry file is given.
    pub fn with_default_voxels() -> Self {
        let mut registry = Self::new();
        for (name, solid) in [
            ("stone", true),
            ("dirt", true),
            ("grass", true),
            ("sand", true),
            ("water", false),
            ("wood", true),
            ("leaves", true),
            ("glass", true),
        ] {
            // Names above are unique, so registration cannot fail.
            let _ = registry.register(VoxelDefinition::new(name, solid, name));
        }
        registry
    }

    /// Builds a registry from a full definition list, air first.
    pub fn from_definitions(definitions: Vec<VoxelDefinition>) -> Result<Self, RegistryError> {
        let mut definitions = definitions.into_iter();
        let first = definitions.next().ok_or(RegistryError::Empty)?;
        if first.name != "air" {
            return Err(RegistryError::AirNotFirst(first.name));
        }

        let mut registry = Self::new();
        registry.definitions[AIR as usize] = first;
        for definition in definitions {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, definition: VoxelDefinition) -> Result<VoxelId, RegistryError> {
        if self.by_name.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateName(definition.name));
        }
        let id = VoxelId::try_from(self.definitions.len()).map_err(|_| RegistryError::Full)?;
        self.by_name.insert(definition.name.clone(), id);
        self.definitions.push(definition);
        Ok(id)
    }

    pub fn contains(&self, id: VoxelId) -> bool {
        (id as usize) < self.definitions.len()
    }

    pub fn get(&self, id: VoxelId) -> Option<&VoxelDefinition> {
        self.definitions.get(id as usize)
    }

    pub fn id_of(&self, name: &str) -> Option<VoxelId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn definitions(&self) -> &[VoxelDefinition] {
        &self.definitions
    }
}

impl Default for VoxelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_air_is_zero() {
        let registry = VoxelRegistry::with_default_voxels();
        assert_eq!(registry.id_of("air"), Some(AIR));
        assert_eq!(registry.id_of("stone"), Some(1));
        assert!(registry.contains(registry.len() as VoxelId - 1));
        assert!(!registry.contains(registry.len() as VoxelId));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = VoxelRegistry::new();
        registry.register(VoxelDefinition::new("stone", true, "stone")).unwrap();
        assert_eq!(
            registry.register(VoxelDefinition::new("stone", true, "other")),
            Err(RegistryError::DuplicateName("stone".to_string()))
        );
    }

    #[test]
    fn test_from_definitions() {
        let registry = VoxelRegistry::from_definitions(vec![
            VoxelDefinition::new("air", false, ""),
            VoxelDefinition::new("marble", true, "marble"),
        ])
        .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().name, "marble");

        assert_eq!(
            VoxelRegistry::from_definitions(vec![VoxelDefinition::new("dirt", true, "dirt")])
                .unwrap_err(),
            RegistryError::AirNotFirst("dirt".to_string())
        );
        assert_eq!(
            VoxelRegistry::from_definitions(vec![]).unwrap_err(),
            RegistryError::Empty
        );
    }
}

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Allow-list of event categories a caller may read. Consumed by the query
/// engine as its pre-grouping filter stage; events outside the grant never
/// contribute to a group's member count and cannot become a representative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CategoryGrant {
    All(AllMarker),
    Only(BTreeSet<String>),
}

/// Serialized form of the unrestricted grant (`"*"` in config files).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllMarker {
    #[serde(rename = "*")]
    Star,
}

impl CategoryGrant {
    pub fn all() -> Self {
        CategoryGrant::All(AllMarker::Star)
    }

    pub fn only<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CategoryGrant::Only(categories.into_iter().map(Into::into).collect())
    }

    pub fn none() -> Self {
        CategoryGrant::Only(BTreeSet::new())
    }

    pub fn permits(&self, category: &str) -> bool {
        match self {
            CategoryGrant::All(_) => true,
            CategoryGrant::Only(set) => set.contains(category),
        }
    }

    /// A grant that can never match anything short-circuits query paths.
    pub fn is_empty(&self) -> bool {
        match self {
            CategoryGrant::All(_) => false,
            CategoryGrant::Only(set) => set.is_empty(),
        }
    }
}

/// Resolves a caller identity to the categories it may read. Modeled as a
/// port so the host's permission registry stays out of the engine.
pub trait PermissionResolver: Send + Sync {
    fn resolve(&self, token: Option<&str>) -> CategoryGrant;
}

/// Config-declared token grants with a default for anonymous callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticGrants {
    /// Grant applied when no token is presented or the token is unknown.
    #[serde(default = "default_grant")]
    pub default: CategoryGrant,
    #[serde(default)]
    pub tokens: BTreeMap<String, BTreeSet<String>>,
}

impl Default for StaticGrants {
    fn default() -> Self {
        Self {
            default: default_grant(),
            tokens: BTreeMap::new(),
        }
    }
}

fn default_grant() -> CategoryGrant {
    CategoryGrant::all()
}

impl PermissionResolver for StaticGrants {
    fn resolve(&self, token: Option<&str>) -> CategoryGrant {
        match token {
            Some(token) => match self.tokens.get(token) {
                Some(categories) => CategoryGrant::Only(categories.clone()),
                None => self.default.clone(),
            },
            None => self.default.clone(),
        }
    }
}

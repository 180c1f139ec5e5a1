use std::fmt::{Display, Formatter};

/// Identity that partitions the mutation queue and overlays.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User {
    pub uid: Option<String>,
}

impl User {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key used to partition per-user caches.
    pub fn to_key(&self) -> &str {
        self.uid.as_deref().unwrap_or("anonymous-user")
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

use std::fmt::{Display, Formatter};

use crate::firestore::model::ResourcePath;

pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Project and database pair that prefixes every resource name on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// `projects/{project}/databases/{database}`
    pub fn database_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }

    pub fn documents_root(&self) -> ResourcePath {
        ResourcePath::from_segments([
            "projects",
            self.project_id.as_str(),
            "databases",
            self.database.as_str(),
            "documents",
        ])
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.database_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_database_name() {
        let db = DatabaseId::default("p");
        assert!(db.is_default_database());
        assert_eq!(db.database_name(), "projects/p/databases/(default)");
        assert_eq!(
            db.documents_root().canonical_string(),
            "projects/p/databases/(default)/documents"
        );
    }
}

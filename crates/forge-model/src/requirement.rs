//! Feature requirement (the input of a workflow)

use crate::task::WorkerClass;
use serde::{Deserialize, Serialize};

/// Kind of change a requirement asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    /// New functionality
    Feature,
    /// Defect correction
    Bugfix,
    /// Behavior-preserving restructuring
    Refactor,
    /// Documentation only
    Documentation,
}

impl Default for RequirementKind {
    fn default() -> Self {
        RequirementKind::Feature
    }
}

/// Rough size of a requirement, drives task granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// At most two stories and three criteria
    Simple,
    /// At most five stories
    Moderate,
    /// Anything larger
    Complex,
}

/// One user story
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStory {
    /// Story identifier
    pub id: String,
    /// Story text
    pub description: String,
    /// Preferred worker class, if the story targets one layer
    #[serde(default)]
    pub worker_class: Option<WorkerClass>,
}

impl UserStory {
    /// Create a story without a worker class hint
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            worker_class: None,
        }
    }

    /// With worker class hint
    #[inline]
    #[must_use]
    pub fn for_class(mut self, class: WorkerClass) -> Self {
        self.worker_class = Some(class);
        self
    }
}

/// Parsed feature requirement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Requirement identifier (also the feature id for failure specifications)
    pub id: String,
    /// Title
    pub title: String,
    /// Requirement kind
    #[serde(default)]
    pub kind: RequirementKind,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// User stories
    #[serde(default)]
    pub user_stories: Vec<UserStory>,
    /// Acceptance criteria
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl Requirement {
    /// Create a requirement with id and title
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    /// With description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// With kind
    #[inline]
    #[must_use]
    pub fn with_kind(mut self, kind: RequirementKind) -> Self {
        self.kind = kind;
        self
    }

    /// With user story
    #[inline]
    #[must_use]
    pub fn with_story(mut self, story: UserStory) -> Self {
        self.user_stories.push(story);
        self
    }

    /// With acceptance criterion
    #[inline]
    #[must_use]
    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.acceptance_criteria.push(criterion.into());
        self
    }

    /// Every missing or blank field, in declaration order
    #[must_use]
    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.id.trim().is_empty() {
            missing.push("id".to_string());
        }
        if self.title.trim().is_empty() {
            missing.push("title".to_string());
        }
        if self.user_stories.is_empty() {
            missing.push("user_stories".to_string());
        }
        for (idx, story) in self.user_stories.iter().enumerate() {
            if story.description.trim().is_empty() {
                missing.push(format!("user_stories[{idx}].description"));
            }
        }
        if self.acceptance_criteria.is_empty() {
            missing.push("acceptance_criteria".to_string());
        }
        for (idx, criterion) in self.acceptance_criteria.iter().enumerate() {
            if criterion.trim().is_empty() {
                missing.push(format!("acceptance_criteria[{idx}]"));
            }
        }
        missing
    }

    /// Complexity classification
    #[must_use]
    pub fn complexity(&self) -> Complexity {
        let stories = self.user_stories.len();
        let criteria = self.acceptance_criteria.len();
        if stories <= 2 && criteria <= 3 {
            Complexity::Simple
        } else if stories <= 5 {
            Complexity::Moderate
        } else {
            Complexity::Complex
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_requirement_lists_every_missing_field() {
        let missing = Requirement::default().missing_fields();
        assert_eq!(
            missing,
            vec!["id", "title", "user_stories", "acceptance_criteria"]
        );
    }

    #[test]
    fn blank_story_and_criterion_are_reported() {
        let req = Requirement::new("r1", "Login")
            .with_story(UserStory::new("s1", " "))
            .with_criterion("");
        assert_eq!(
            req.missing_fields(),
            vec!["user_stories[0].description", "acceptance_criteria[0]"]
        );
    }

    #[test]
    fn complexity_thresholds() {
        let mut req = Requirement::new("r", "t")
            .with_story(UserStory::new("s1", "a"))
            .with_criterion("c1");
        assert_eq!(req.complexity(), Complexity::Simple);

        for i in 2..=4 {
            req = req.with_story(UserStory::new(format!("s{i}"), "b"));
        }
        assert_eq!(req.complexity(), Complexity::Moderate);

        for i in 5..=6 {
            req = req.with_story(UserStory::new(format!("s{i}"), "c"));
        }
        assert_eq!(req.complexity(), Complexity::Complex);
    }
}

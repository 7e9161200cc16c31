use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};

pub const ROOT_BRANCH_NAME: &str = "Main";
pub const DEFAULT_PROJECT_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub role: TurnRole,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub text_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(prompt: impl Into<String>) -> Self {
        Self {
            turn_id: Uuid::new_v4().to_string(),
            role: TurnRole::User,
            prompt: Some(prompt.into()),
            image_id: None,
            image_url: None,
            thumbnail_url: None,
            text_response: None,
            usage: None,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(payload: AssistantPayload) -> Self {
        Self {
            turn_id: Uuid::new_v4().to_string(),
            role: TurnRole::Assistant,
            prompt: None,
            image_id: payload.image_id,
            image_url: payload.image_url,
            thumbnail_url: payload.thumbnail_url,
            text_response: payload.text_response,
            usage: payload.usage,
            timestamp: Utc::now(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == TurnRole::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == TurnRole::Assistant
    }
}

/// What a successful model call contributes to an assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantPayload {
    pub image_id: Option<String>,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub text_response: Option<String>,
    pub usage: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: String,
    pub name: String,
    #[serde(default)]
    pub parent_branch_id: Option<String>,
    #[serde(default)]
    pub fork_turn_index: Option<usize>,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

impl Branch {
    pub fn root() -> Self {
        Self {
            branch_id: Uuid::new_v4().to_string(),
            name: ROOT_BRANCH_NAME.to_string(),
            parent_branch_id: None,
            fork_turn_index: None,
            turns: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_branch_id.is_none()
    }

    /// True when the branch ends on a user turn still waiting for its reply.
    pub fn has_pending_user_turn(&self) -> bool {
        self.turns.last().is_some_and(Turn::is_user)
    }

    pub fn latest_image_id(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .filter(|turn| turn.is_assistant())
            .find_map(|turn| turn.image_id.as_deref())
    }

    pub fn latest_image_url(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .filter(|turn| turn.is_assistant())
            .find_map(|turn| turn.image_url.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub project_id: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub branches: IndexMap<String, Branch>,
    pub active_branch_id: String,
    #[serde(default)]
    pub subject_locked: bool,
    #[serde(default)]
    pub subject_lock_image_id: Option<String>,
}

impl Session {
    pub fn new(project_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        let root = Branch::root();
        let now = Utc::now();
        let active_branch_id = root.branch_id.clone();
        let mut branches = IndexMap::new();
        branches.insert(root.branch_id.clone(), root);
        Self {
            session_id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            model_id: model_id.into(),
            created_at: now,
            updated_at: now,
            branches,
            active_branch_id,
            subject_locked: false,
            subject_lock_image_id: None,
        }
    }

    pub fn active_branch(&self) -> EngineResult<&Branch> {
        self.branches.get(&self.active_branch_id).ok_or_else(|| {
            EngineError::invalid_state(format!(
                "active branch {} missing from session {}",
                self.active_branch_id, self.session_id
            ))
        })
    }

    pub fn active_branch_mut(&mut self) -> EngineResult<&mut Branch> {
        let session_id = self.session_id.clone();
        let active = self.active_branch_id.clone();
        self.branches.get_mut(&active).ok_or_else(|| {
            EngineError::invalid_state(format!(
                "active branch {active} missing from session {session_id}"
            ))
        })
    }

    /// Bumps `updated_at`, never letting it move backwards on clock skew.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Structural checks applied to every document read back from storage.
    pub fn validate(&self) -> EngineResult<()> {
        if !self.branches.contains_key(&self.active_branch_id) {
            return Err(EngineError::invalid_state(format!(
                "session {} points at unknown active branch {}",
                self.session_id, self.active_branch_id
            )));
        }
        let roots = self.branches.values().filter(|b| b.is_root()).count();
        if roots != 1 {
            return Err(EngineError::invalid_state(format!(
                "session {} has {roots} root branches",
                self.session_id
            )));
        }
        for (key, branch) in &self.branches {
            if key != &branch.branch_id {
                return Err(EngineError::invalid_state(format!(
                    "branch key {key} does not match branch id {}",
                    branch.branch_id
                )));
            }
            if let Some(parent) = branch.parent_branch_id.as_deref() {
                if !self.branches.contains_key(parent) {
                    return Err(EngineError::invalid_state(format!(
                        "branch {} has unknown parent {parent}",
                        branch.branch_id
                    )));
                }
            }
            // The parent may be reverted after the fork, so the index is not
            // bounded by its current length.
            if branch.parent_branch_id.is_some() != branch.fork_turn_index.is_some() {
                return Err(EngineError::invalid_state(format!(
                    "branch {} must carry both a parent and a fork index, or neither",
                    branch.branch_id
                )));
            }
            if let Some(at) = branch
                .turns
                .windows(2)
                .position(|pair| pair[0].is_user() && pair[1].is_user())
            {
                return Err(EngineError::invalid_state(format!(
                    "branch {} has consecutive user turns at {at} and {}",
                    branch.branch_id,
                    at + 1
                )));
            }
        }
        if self.subject_locked != self.subject_lock_image_id.is_some() {
            return Err(EngineError::invalid_state(format!(
                "session {} subject lock flag disagrees with pinned image",
                self.session_id
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> SessionSummary {
        let active = self.branches.get(&self.active_branch_id);
        SessionSummary {
            session_id: self.session_id.clone(),
            project_id: self.project_id.clone(),
            model_id: self.model_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            turn_count: active.map(|b| b.turns.len()).unwrap_or(0),
            branch_count: self.branches.len(),
            active_branch_name: active.map(|b| b.name.clone()).unwrap_or_default(),
            last_image_url: active
                .and_then(Branch::latest_image_url)
                .map(str::to_string),
            subject_locked: self.subject_locked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub project_id: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: usize,
    pub branch_count: usize,
    pub active_branch_name: String,
    pub last_image_url: Option<String>,
    pub subject_locked: bool,
}

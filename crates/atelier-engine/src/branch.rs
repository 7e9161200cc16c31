//! Turn-tree transitions for a session.
//!
//! Every function takes the current session by reference and returns a new
//! value; callers swap it in under the session lock. Forks copy turns by
//! value, so no two branches ever share a turn sequence.

use atelier_contracts::errors::{EngineError, EngineResult};
use atelier_contracts::sessions::{AssistantPayload, Branch, Session, Turn};
use uuid::Uuid;

pub fn create_session(project_id: &str, model_id: &str) -> Session {
    Session::new(project_id, model_id)
}

pub fn append_user_turn(session: &Session, prompt: &str) -> EngineResult<Session> {
    let mut next = session.clone();
    let branch = next.active_branch_mut()?;
    if branch.has_pending_user_turn() {
        return Err(EngineError::invalid_state(format!(
            "branch {} already has a user turn awaiting a response",
            branch.name
        )));
    }
    branch.turns.push(Turn::user(prompt));
    next.touch();
    Ok(next)
}

pub fn append_assistant_turn(session: &Session, payload: AssistantPayload) -> EngineResult<Session> {
    let mut next = session.clone();
    let branch = next.active_branch_mut()?;
    if !branch.has_pending_user_turn() {
        return Err(EngineError::invalid_state(format!(
            "branch {} has no pending user turn to answer",
            branch.name
        )));
    }
    branch.turns.push(Turn::assistant(payload));
    next.touch();
    Ok(next)
}

/// Seeds a fresh session with the generation it continues from. The image
/// turn may stand alone when no prompt is known.
pub fn append_seed_turns(
    session: &Session,
    prompt: Option<&str>,
    image: Option<AssistantPayload>,
) -> EngineResult<Session> {
    let mut next = match prompt.map(str::trim).filter(|value| !value.is_empty()) {
        Some(prompt) => append_user_turn(session, prompt)?,
        None => session.clone(),
    };
    if let Some(payload) = image {
        let branch = next.active_branch_mut()?;
        if branch.turns.last().is_some_and(Turn::is_assistant) {
            return Err(EngineError::invalid_state(
                "seed image cannot follow an assistant turn",
            ));
        }
        branch.turns.push(Turn::assistant(payload));
        next.touch();
    }
    Ok(next)
}

/// Removes the last complete pair, or a dangling user turn on its own.
pub fn undo(session: &Session) -> EngineResult<Session> {
    let mut next = session.clone();
    let branch = next.active_branch_mut()?;
    let Some(last) = branch.turns.pop() else {
        return Err(EngineError::invalid_state(format!(
            "nothing to undo on branch {}",
            branch.name
        )));
    };
    if last.is_assistant() && branch.has_pending_user_turn() {
        branch.turns.pop();
    }
    next.touch();
    Ok(next)
}

/// Keeps `turns[0..=index]`; `-1` empties the branch.
pub fn revert_to_turn(session: &Session, index: i64) -> EngineResult<Session> {
    let mut next = session.clone();
    let branch = next.active_branch_mut()?;
    let len = branch.turns.len() as i64;
    if index < -1 || index >= len {
        return Err(EngineError::invalid_state(format!(
            "turn index {index} out of range for branch {} with {len} turns",
            branch.name
        )));
    }
    branch.turns.truncate((index + 1) as usize);
    next.touch();
    Ok(next)
}

pub fn branch_from_turn(session: &Session, index: i64, name: Option<&str>) -> EngineResult<Session> {
    let source = session.active_branch()?;
    let len = source.turns.len() as i64;
    if index < 0 || index >= len {
        return Err(EngineError::invalid_state(format!(
            "cannot fork branch {} at turn {index}; it has {len} turns",
            source.name
        )));
    }
    let fork_at = index as usize;
    let name = name
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| next_branch_name(session));
    let branch = Branch {
        branch_id: Uuid::new_v4().to_string(),
        name,
        parent_branch_id: Some(source.branch_id.clone()),
        fork_turn_index: Some(fork_at),
        turns: source.turns[..=fork_at].to_vec(),
    };

    let mut next = session.clone();
    next.active_branch_id = branch.branch_id.clone();
    next.branches.insert(branch.branch_id.clone(), branch);
    next.touch();
    Ok(next)
}

pub fn switch_branch(session: &Session, branch_id: &str) -> EngineResult<Session> {
    if !session.branches.contains_key(branch_id) {
        return Err(EngineError::not_found(format!(
            "branch {branch_id} in session {}",
            session.session_id
        )));
    }
    let mut next = session.clone();
    next.active_branch_id = branch_id.to_string();
    next.touch();
    Ok(next)
}

/// "Branch N" with the smallest free N starting at the current branch count.
fn next_branch_name(session: &Session) -> String {
    let mut n = session.branches.len();
    loop {
        let candidate = format!("Branch {n}");
        if !session.branches.values().any(|branch| branch.name == candidate) {
            return candidate;
        }
        n += 1;
    }
}

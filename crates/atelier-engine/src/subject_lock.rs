use atelier_contracts::errors::{EngineError, EngineResult};
use atelier_contracts::generation::GenerationParams;
use atelier_contracts::models::ModelCategory;
use atelier_contracts::sessions::Session;

/// Which images go to the backend alongside a prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferencePlan {
    pub primary: Option<String>,
    pub additional: Vec<String>,
    pub include_history: bool,
}

impl ReferencePlan {
    pub fn all_ids(&self) -> Vec<String> {
        self.primary
            .iter()
            .chain(self.additional.iter())
            .cloned()
            .collect()
    }
}

/// Pins `image_id`, or the latest image on the active branch when none is given.
pub fn lock(session: &Session, image_id: Option<&str>) -> EngineResult<Session> {
    let pinned = match image_id.map(str::trim).filter(|value| !value.is_empty()) {
        Some(id) => id.to_string(),
        None => session
            .active_branch()?
            .latest_image_id()
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::invalid_state("no image on the active branch to lock onto")
            })?,
    };
    let mut next = session.clone();
    next.subject_locked = true;
    next.subject_lock_image_id = Some(pinned);
    next.touch();
    Ok(next)
}

pub fn unlock(session: &Session) -> Session {
    let mut next = session.clone();
    next.subject_locked = false;
    next.subject_lock_image_id = None;
    next.touch();
    next
}

pub fn set_subject_lock(
    session: &Session,
    locked: bool,
    image_id: Option<&str>,
) -> EngineResult<Session> {
    if locked {
        lock(session, image_id)
    } else {
        Ok(unlock(session))
    }
}

/// References for a conversational edit on `session`.
///
/// Conversational models carry identity through history, so the lock adds
/// nothing. Image-only models get the pinned image first, then the caller's
/// upload, then the most recent output; uploads are demoted while locked.
pub fn plan_references(
    session: &Session,
    category: ModelCategory,
    params: &GenerationParams,
) -> EngineResult<ReferencePlan> {
    let mut plan = ReferencePlan {
        include_history: category.is_conversational(),
        ..ReferencePlan::default()
    };
    let upload = params.reference_image_id.clone();

    match category {
        ModelCategory::Conversational => {
            plan.primary = upload;
        }
        ModelCategory::ImageOnly => {
            let locked = session
                .subject_lock_image_id
                .clone()
                .filter(|_| session.subject_locked);
            if let Some(pinned) = locked {
                if let Some(upload) = upload.filter(|id| id != &pinned) {
                    plan.additional.push(upload);
                }
                plan.primary = Some(pinned);
            } else {
                plan.primary = upload.or_else(|| {
                    session
                        .active_branch()
                        .ok()
                        .and_then(|branch| branch.latest_image_id())
                        .map(str::to_string)
                });
            }
        }
    }

    push_extra_references(&mut plan, params);
    Ok(plan)
}

/// References for a one-shot generation outside any session.
pub fn plan_standalone(params: &GenerationParams) -> ReferencePlan {
    let mut plan = ReferencePlan {
        primary: params.reference_image_id.clone(),
        ..ReferencePlan::default()
    };
    push_extra_references(&mut plan, params);
    plan
}

fn push_extra_references(plan: &mut ReferencePlan, params: &GenerationParams) {
    let extras = params
        .style_reference_id
        .iter()
        .chain(params.character_reference_ids.iter());
    for id in extras {
        if plan.primary.as_ref() != Some(id) && !plan.additional.contains(id) {
            plan.additional.push(id.clone());
        }
    }
}

// Admin catalog surface: operation templates and community goal templates.
// The engine reducers in lib.rs only ever read these tables; every write
// comes through here and is gated on the authorized_worker table.

use spacetimedb::{reducer, ReducerContext, Table, Timestamp};

use crate::{
    community_goal, community_goal_template, operation_template, user_operation,
    ensure_worker, Cadence, CommunityGoal, CommunityGoalTemplate, GoalStatus, Metric,
    OperationTemplate, MICROS_PER_DAY,
};

/// Shared field validation for both template kinds.
/// Dynamic shapes from the admin panel are normalized here, at the storage
/// boundary - the engine never re-validates catalog rows.
fn validate_template_fields(title: &str, target_value: f32, xp_reward: u32) -> Result<(), String> {
    if title.trim().is_empty() {
        return Err("INVALID_TEMPLATE: title must not be empty".to_string());
    }
    if !target_value.is_finite() || target_value <= 0.0 {
        return Err("INVALID_TEMPLATE: target_value must be positive".to_string());
    }
    if xp_reward == 0 {
        return Err("INVALID_TEMPLATE: xp_reward must be positive".to_string());
    }
    Ok(())
}

/// Whether an edit changes how live instances are classified or scored.
/// Cosmetic fields (title, description, focus, translations) are always
/// safe to edit; these three are not while instances reference the template.
fn is_structural_edit(existing: &OperationTemplate, cadence: &Cadence, metric: &Metric, target_value: f32) -> bool {
    existing.cadence != *cadence || existing.metric != *metric || existing.target_value != target_value
}

/// Whether any unexpired instance still references this template
fn template_in_use(ctx: &ReducerContext, template_id: u64) -> bool {
    let now_micros = ctx.timestamp.to_micros_since_unix_epoch();
    ctx.db
        .user_operation()
        .template_id()
        .filter(&template_id)
        .any(|op| op.expires_at.to_micros_since_unix_epoch() > now_micros)
}

/// Translations are stored opaquely but must at least be a JSON object
/// (locale -> {title, description})
fn validate_translations(translations: &Option<String>) -> Result<(), String> {
    if let Some(raw) = translations {
        let parsed: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| format!("INVALID_TEMPLATE: translations is not valid JSON: {}", e))?;
        if !parsed.is_object() {
            return Err("INVALID_TEMPLATE: translations must be a JSON object".to_string());
        }
    }
    Ok(())
}

/// Create or update a solo operation template
#[reducer]
pub fn upsert_operation_template(
    ctx: &ReducerContext,
    id: Option<u64>,
    title: String,
    description: String,
    cadence: Cadence,
    metric: Metric,
    target_value: f32,
    xp_reward: u32,
    focus: Vec<String>,
    translations: Option<String>,
) -> Result<(), String> {
    ensure_worker(ctx)?;
    validate_template_fields(&title, target_value, xp_reward)?;
    validate_translations(&translations)?;

    match id {
        Some(template_id) => {
            let mut existing = ctx
                .db
                .operation_template()
                .id()
                .find(&template_id)
                .ok_or("NOT_FOUND: no such template".to_string())?;
            // Live instances are classified by their template's current
            // cadence/metric/target; rewriting those under them would let a
            // daily instance squat in a weekly slot or move its goalposts.
            // Retire the template and wait out the window instead.
            if is_structural_edit(&existing, &cadence, &metric, target_value)
                && template_in_use(ctx, template_id)
            {
                return Err(
                    "TEMPLATE_IN_USE: cadence, metric and target are frozen while active instances reference this template"
                        .to_string(),
                );
            }
            existing.title = title.clone();
            existing.description = description;
            existing.cadence = cadence;
            existing.metric = metric;
            existing.target_value = target_value;
            existing.xp_reward = xp_reward;
            existing.focus = focus;
            existing.translations = translations;
            ctx.db.operation_template().id().update(existing);
            log::info!("[CATALOG] template updated id:{} \"{}\"", template_id, title);
        }
        None => {
            let inserted = ctx.db.operation_template().insert(OperationTemplate {
                id: 0, // auto_inc
                title: title.clone(),
                description,
                cadence,
                metric,
                target_value,
                xp_reward,
                focus,
                translations,
                is_active: true,
                created_at: ctx.timestamp,
            });
            log::info!("[CATALOG] template created id:{} \"{}\"", inserted.id, title);
        }
    }
    Ok(())
}

/// Retire or revive a template. Retired templates keep their rows (live
/// instances still reference them) but are never assigned again.
#[reducer]
pub fn set_template_active(ctx: &ReducerContext, template_id: u64, active: bool) -> Result<(), String> {
    ensure_worker(ctx)?;

    let mut template = ctx
        .db
        .operation_template()
        .id()
        .find(&template_id)
        .ok_or("NOT_FOUND: no such template".to_string())?;
    template.is_active = active;
    ctx.db.operation_template().id().update(template);

    log::info!("[CATALOG] template id:{} active:{}", template_id, active);
    Ok(())
}

/// Delete a template outright. Refused while any unexpired instance still
/// references it - retire with set_template_active instead and delete after
/// the window rolls over.
#[reducer]
pub fn delete_operation_template(ctx: &ReducerContext, template_id: u64) -> Result<(), String> {
    ensure_worker(ctx)?;

    if ctx.db.operation_template().id().find(&template_id).is_none() {
        return Err("NOT_FOUND: no such template".to_string());
    }

    if template_in_use(ctx, template_id) {
        return Err("TEMPLATE_IN_USE: active instances still reference this template".to_string());
    }

    ctx.db.operation_template().id().delete(&template_id);
    log::info!("[CATALOG] template deleted id:{}", template_id);
    Ok(())
}

/// Create or update a community goal template
#[reducer]
pub fn upsert_community_goal_template(
    ctx: &ReducerContext,
    id: Option<u64>,
    title: String,
    description: String,
    metric: Metric,
    target_value: f32,
    xp_reward: u32,
    duration_days: u32,
) -> Result<(), String> {
    ensure_worker(ctx)?;
    validate_template_fields(&title, target_value, xp_reward)?;
    if duration_days == 0 {
        return Err("INVALID_TEMPLATE: duration_days must be positive".to_string());
    }

    match id {
        Some(template_id) => {
            let mut existing = ctx
                .db
                .community_goal_template()
                .id()
                .find(&template_id)
                .ok_or("NOT_FOUND: no such goal template".to_string())?;
            existing.title = title.clone();
            existing.description = description;
            existing.metric = metric;
            existing.target_value = target_value;
            existing.xp_reward = xp_reward;
            existing.duration_days = duration_days;
            ctx.db.community_goal_template().id().update(existing);
            log::info!("[CATALOG] goal template updated id:{} \"{}\"", template_id, title);
        }
        None => {
            let inserted = ctx.db.community_goal_template().insert(CommunityGoalTemplate {
                id: 0, // auto_inc
                title: title.clone(),
                description,
                metric,
                target_value,
                xp_reward,
                duration_days,
                is_active: true,
                created_at: ctx.timestamp,
            });
            log::info!("[CATALOG] goal template created id:{} \"{}\"", inserted.id, title);
        }
    }
    Ok(())
}

/// Launch a community goal from its template. One active goal per template
/// at a time - launching again while one runs is a conflict, not a stack.
#[reducer]
pub fn launch_community_goal(ctx: &ReducerContext, template_id: u64) -> Result<(), String> {
    ensure_worker(ctx)?;

    let template = ctx
        .db
        .community_goal_template()
        .id()
        .find(&template_id)
        .ok_or("NOT_FOUND: no such goal template".to_string())?;
    if !template.is_active {
        return Err("TEMPLATE_RETIRED: this goal template is no longer active".to_string());
    }

    let already_running = ctx
        .db
        .community_goal()
        .template_id()
        .filter(&template_id)
        .any(|g| g.status == GoalStatus::Active);
    if already_running {
        return Err("GOAL_ALREADY_ACTIVE: this goal is already running".to_string());
    }

    let now_micros = ctx.timestamp.to_micros_since_unix_epoch();
    let ends = now_micros + i64::from(template.duration_days) * MICROS_PER_DAY;
    let goal = ctx.db.community_goal().insert(CommunityGoal {
        id: 0, // auto_inc
        template_id,
        title: template.title.clone(),
        metric: template.metric,
        target_value: template.target_value,
        xp_reward: template.xp_reward,
        current_progress: 0.0,
        status: GoalStatus::Active,
        starts_at: ctx.timestamp,
        ends_at: Timestamp::from_micros_since_unix_epoch(ends),
        completed_at: None,
    });

    log::info!(
        "[CATALOG] goal launched id:{} \"{}\" target:{} days:{}",
        goal.id,
        template.title,
        template.target_value,
        template.duration_days
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacetimedb::Timestamp;

    fn sample_template() -> OperationTemplate {
        OperationTemplate {
            id: 1,
            title: "Iron Mile".to_string(),
            description: "Run a mile".to_string(),
            cadence: Cadence::Daily,
            metric: Metric::Distance,
            target_value: 1.6,
            xp_reward: 150,
            focus: vec!["cardio".to_string()],
            translations: None,
            is_active: true,
            created_at: Timestamp::from_micros_since_unix_epoch(0),
        }
    }

    #[test]
    fn cosmetic_edits_are_not_structural() {
        // Same cadence/metric/target: title, description, focus and
        // translations may change freely even with live instances
        let t = sample_template();
        assert!(!is_structural_edit(&t, &Cadence::Daily, &Metric::Distance, 1.6));
    }

    #[test]
    fn cadence_metric_and_target_edits_are_structural() {
        let t = sample_template();
        assert!(is_structural_edit(&t, &Cadence::Weekly, &Metric::Distance, 1.6));
        assert!(is_structural_edit(&t, &Cadence::Daily, &Metric::Duration, 1.6));
        assert!(is_structural_edit(&t, &Cadence::Daily, &Metric::Distance, 5.0));
    }
}

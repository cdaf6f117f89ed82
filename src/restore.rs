// Bulk restore reducers for disaster recovery
// Accept JSON arrays exported from the admin panel (TypeScript SDK format)

use spacetimedb::{reducer, ReducerContext, Table};

use serde_json::Value;

use crate::{
    ensure_worker, operation_template, user_progression, Cadence, Metric, OperationTemplate,
    UserProgression,
};
use crate::progression::level_for_xp;
use crate::utc_day_index;

fn parse_cadence(val: &Value) -> Result<Cadence, String> {
    match val.as_str() {
        Some("daily") => Ok(Cadence::Daily),
        Some("weekly") => Ok(Cadence::Weekly),
        other => Err(format!("Invalid cadence: {:?}", other)),
    }
}

fn parse_metric(val: &Value) -> Result<Metric, String> {
    // Legacy exports mixed cases for the metric field, accept both
    match val.as_str().map(|s| s.to_lowercase()).as_deref() {
        Some("workouts") => Ok(Metric::Workouts),
        Some("volume") => Ok(Metric::Volume),
        Some("distance") => Ok(Metric::Distance),
        Some("duration") => Ok(Metric::Duration),
        other => Err(format!("Invalid metric: {:?}", other)),
    }
}

fn parse_string_array(val: Option<&Value>) -> Vec<String> {
    val.and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Bulk restore the operation template catalog from a JSON array.
/// Upserts by id so a partial restore can be re-run safely.
#[reducer]
pub fn bulk_restore_templates(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ensure_worker(ctx).is_err() {
        log::warn!("Unauthorized bulk_restore_templates attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;
    let templates = data.as_array().ok_or("Expected JSON array of templates")?;

    let mut count = 0;
    for (i, t) in templates.iter().enumerate() {
        let template = OperationTemplate {
            id: t.get("id").and_then(|v| v.as_u64()).ok_or(format!("Template {}: missing id", i))?,
            title: t.get("title").and_then(|v| v.as_str()).ok_or(format!("Template {}: missing title", i))?.to_string(),
            description: t.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            cadence: parse_cadence(t.get("cadence").ok_or(format!("Template {}: missing cadence", i))?)?,
            metric: parse_metric(t.get("metric").ok_or(format!("Template {}: missing metric", i))?)?,
            target_value: t.get("targetValue").and_then(|v| v.as_f64()).ok_or(format!("Template {}: missing targetValue", i))? as f32,
            xp_reward: t.get("xpReward").and_then(|v| v.as_u64()).ok_or(format!("Template {}: missing xpReward", i))? as u32,
            focus: parse_string_array(t.get("focus")),
            translations: t.get("translations").filter(|v| v.is_object()).map(|v| v.to_string()),
            is_active: t.get("isActive").and_then(|v| v.as_bool()).unwrap_or(true),
            created_at: ctx.timestamp,
        };

        if ctx.db.operation_template().id().find(&template.id).is_some() {
            ctx.db.operation_template().id().update(template);
        } else {
            ctx.db.operation_template().insert(template);
        }
        count += 1;
    }

    log::info!("[RESTORE] templates restored:{}", count);
    Ok(())
}

/// Bulk restore user progressions from a JSON array.
/// The level cache is recomputed from cycle XP rather than trusted from the
/// export, so a restore also repairs any stale cached levels.
#[reducer]
pub fn bulk_restore_progressions(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ensure_worker(ctx).is_err() {
        log::warn!("Unauthorized bulk_restore_progressions attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;
    let users = data.as_array().ok_or("Expected JSON array of progressions")?;

    let mut count = 0;
    for (i, u) in users.iter().enumerate() {
        let cycle_xp = u.get("cycleXp").and_then(|v| v.as_u64()).ok_or(format!("Progression {}: missing cycleXp", i))?;
        let lifetime_xp = u.get("lifetimeXp").and_then(|v| v.as_u64()).ok_or(format!("Progression {}: missing lifetimeXp", i))?;
        if lifetime_xp < cycle_xp {
            return Err(format!("Progression {}: lifetimeXp below cycleXp", i));
        }

        let progression = UserProgression {
            user_id: u.get("userId").and_then(|v| v.as_str()).ok_or(format!("Progression {}: missing userId", i))?.to_string(),
            level: level_for_xp(cycle_xp),
            lifetime_xp,
            cycle_xp,
            prestige_rank: u.get("prestigeRank").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            rerolls_available: u.get("rerollsAvailable").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            focus: parse_string_array(u.get("focus")),
            last_reroll_day: utc_day_index(ctx.timestamp),
            created_at: ctx.timestamp,
            last_active: ctx.timestamp,
        };

        if ctx.db.user_progression().user_id().find(&progression.user_id).is_some() {
            ctx.db.user_progression().user_id().update(progression);
        } else {
            ctx.db.user_progression().insert(progression);
        }
        count += 1;
    }

    log::info!("[RESTORE] progressions restored:{}", count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cadence_parsing() {
        assert_eq!(parse_cadence(&json!("daily")).unwrap(), Cadence::Daily);
        assert_eq!(parse_cadence(&json!("weekly")).unwrap(), Cadence::Weekly);
        assert!(parse_cadence(&json!("monthly")).is_err());
        assert!(parse_cadence(&json!(3)).is_err());
    }

    #[test]
    fn metric_parsing_accepts_legacy_case() {
        assert_eq!(parse_metric(&json!("volume")).unwrap(), Metric::Volume);
        assert_eq!(parse_metric(&json!("VOLUME")).unwrap(), Metric::Volume);
        assert_eq!(parse_metric(&json!("Workouts")).unwrap(), Metric::Workouts);
        assert!(parse_metric(&json!("steps")).is_err());
    }

    #[test]
    fn string_arrays_tolerate_missing_and_mixed() {
        assert!(parse_string_array(None).is_empty());
        assert!(parse_string_array(Some(&json!(null))).is_empty());
        assert_eq!(
            parse_string_array(Some(&json!(["strength", 7, "cardio"]))),
            vec!["strength".to_string(), "cardio".to_string()]
        );
    }
}

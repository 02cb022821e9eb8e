use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::inference::CardIdentity;
use crate::models::result::{BudgetStage, FinalResult, FinalStatus, ReasonCode, StageLatencies};

/// Insert or replace the stored result for a work item.
///
/// Keyed by `work_id`, so re-delivery after a retried hand-off never creates
/// a second row.
pub async fn upsert_final_result(pool: &PgPool, result: &FinalResult) -> Result<(), sqlx::Error> {
    let identity = result.identity.clone().unwrap_or_default();
    let overruns = serde_json::to_value(&result.budget_overruns)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO card_results (
            work_id, status, reason, card_name, card_set, card_number, confidence,
            verification_ran, primary_ms, verification_ms, persist_ms, total_latency_ms,
            budget_overruns, completed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (work_id) DO UPDATE SET
            status = EXCLUDED.status,
            reason = EXCLUDED.reason,
            card_name = EXCLUDED.card_name,
            card_set = EXCLUDED.card_set,
            card_number = EXCLUDED.card_number,
            confidence = EXCLUDED.confidence,
            verification_ran = EXCLUDED.verification_ran,
            primary_ms = EXCLUDED.primary_ms,
            verification_ms = EXCLUDED.verification_ms,
            persist_ms = EXCLUDED.persist_ms,
            total_latency_ms = EXCLUDED.total_latency_ms,
            budget_overruns = EXCLUDED.budget_overruns,
            completed_at = EXCLUDED.completed_at,
            updated_at = NOW()
        "#,
    )
    .bind(result.work_id)
    .bind(result.status.as_ref())
    .bind(result.reason.map(|r| r.as_ref().to_string()))
    .bind(identity.name)
    .bind(identity.set)
    .bind(identity.number)
    .bind(result.confidence)
    .bind(result.verification_ran)
    .bind(result.latencies.primary_ms.map(|v| v as i64))
    .bind(result.latencies.verification_ms.map(|v| v as i64))
    .bind(result.latencies.persist_ms.map(|v| v as i64))
    .bind(result.total_latency_ms as i64)
    .bind(overruns)
    .bind(result.completed_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a stored result by work item ID
pub async fn get_final_result(pool: &PgPool, work_id: Uuid) -> Result<Option<FinalResult>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT work_id, status, reason, card_name, card_set, card_number, confidence,
               verification_ran, primary_ms, verification_ms, persist_ms, total_latency_ms,
               budget_overruns, completed_at
        FROM card_results
        WHERE work_id = $1
        "#,
    )
    .bind(work_id)
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let status_str: String = r.try_get("status")?;
    let status: FinalStatus = status_str
        .parse()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let reason: Option<String> = r.try_get("reason")?;
    let reason = reason
        .map(|s| s.parse::<ReasonCode>())
        .transpose()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    let identity = CardIdentity {
        name: r.try_get("card_name")?,
        set: r.try_get("card_set")?,
        number: r.try_get("card_number")?,
    };
    let overruns: serde_json::Value = r.try_get("budget_overruns")?;
    let budget_overruns: Vec<BudgetStage> =
        serde_json::from_value(overruns).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    let primary_ms: Option<i64> = r.try_get("primary_ms")?;
    let verification_ms: Option<i64> = r.try_get("verification_ms")?;
    let persist_ms: Option<i64> = r.try_get("persist_ms")?;
    let total_latency_ms: i64 = r.try_get("total_latency_ms")?;
    let completed_at: DateTime<Utc> = r.try_get("completed_at")?;

    Ok(Some(FinalResult {
        work_id: r.try_get("work_id")?,
        identity: (!identity.is_empty()).then_some(identity),
        confidence: r.try_get("confidence")?,
        verification_ran: r.try_get("verification_ran")?,
        latencies: StageLatencies {
            primary_ms: primary_ms.map(|v| v as u64),
            verification_ms: verification_ms.map(|v| v as u64),
            persist_ms: persist_ms.map(|v| v as u64),
        },
        total_latency_ms: total_latency_ms.max(0) as u64,
        status,
        reason,
        budget_overruns,
        completed_at,
    }))
}

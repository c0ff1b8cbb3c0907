// Bulk restore reducers for disaster recovery
// Accept JSON arrays exported from the admin panel (TypeScript SDK format)
// Also the only seeding path for vocab_word - vocabulary CRUD lives outside
// this module

use spacetimedb::{reducer, ReducerContext, Timestamp, log, Table};
use crate::{Duel, DuelResponse, DuelStatus, DuelWord, VocabWord, authorized_worker};
use crate::{duel, duel_response, duel_word, vocab_word};
use serde_json::Value;

/// Parse Timestamp from SDK JSON format: {"__timestamp_micros_since_unix_epoch__": "123456"}
fn parse_timestamp_json(val: &Value) -> Result<Timestamp, String> {
    let micros_str = val.get("__timestamp_micros_since_unix_epoch__")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp field")?;

    let micros: i64 = micros_str.parse()
        .map_err(|e| format!("Invalid timestamp micros: {}", e))?;

    Ok(Timestamp::from_micros_since_unix_epoch(micros))
}

/// Parse an optional timestamp field (absent or null = None)
fn parse_optional_timestamp(val: Option<&Value>) -> Result<Option<Timestamp>, String> {
    match val {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_timestamp_json(v).map(Some),
    }
}

/// Parse DuelStatus from its SDK JSON tag
fn parse_duel_status(val: &Value) -> Result<DuelStatus, String> {
    let tag = val.as_str().ok_or("Missing or invalid status field")?;
    match tag {
        "Pending" => Ok(DuelStatus::Pending),
        "Active" => Ok(DuelStatus::Active),
        "Completed" => Ok(DuelStatus::Completed),
        "Declined" => Ok(DuelStatus::Declined),
        "Expired" => Ok(DuelStatus::Expired),
        other => Err(format!("Unknown duel status: {}", other)),
    }
}

/// Bulk restore vocab_word table from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_vocab_word(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_vocab_word attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let words = data.as_array()
        .ok_or("Expected JSON array of vocab words")?;

    let mut count = 0;
    for (i, w) in words.iter().enumerate() {
        let word = VocabWord {
            // Ids are preserved so duel_word.word_id keeps pointing at the source row
            id: w.get("id").and_then(|v| v.as_u64()).ok_or(format!("Word {}: missing id", i))?,
            owner_id: w.get("ownerId").and_then(|v| v.as_str()).ok_or(format!("Word {}: missing ownerId", i))?.to_string(),
            prompt: w.get("prompt").and_then(|v| v.as_str()).ok_or(format!("Word {}: missing prompt", i))?.to_string(),
            expected_answer: w.get("expectedAnswer").and_then(|v| v.as_str()).ok_or(format!("Word {}: missing expectedAnswer", i))?.to_string(),
            created_at: parse_timestamp_json(w.get("createdAt").ok_or(format!("Word {}: missing createdAt", i))?)?,
        };

        ctx.db.vocab_word().insert(word);
        count += 1;
    }

    log::info!("✅ Restored {} vocab_word records", count);
    Ok(())
}

/// Bulk restore duel table from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_duel(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_duel attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let duels = data.as_array()
        .ok_or("Expected JSON array of duels")?;

    let mut count = 0;
    for (i, d) in duels.iter().enumerate() {
        let record = Duel {
            id: d.get("id").and_then(|v| v.as_u64()).ok_or(format!("Duel {}: missing id", i))?,
            challenger_id: d.get("challengerId").and_then(|v| v.as_str()).ok_or(format!("Duel {}: missing challengerId", i))?.to_string(),
            opponent_id: d.get("opponentId").and_then(|v| v.as_str()).ok_or(format!("Duel {}: missing opponentId", i))?.to_string(),
            status: parse_duel_status(d.get("status").ok_or(format!("Duel {}: missing status", i))?)?,
            word_count: d.get("wordCount").and_then(|v| v.as_u64()).ok_or(format!("Duel {}: missing wordCount", i))? as u32,
            challenger_score: d.get("challengerScore").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            opponent_score: d.get("opponentScore").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            challenger_time_ms: d.get("challengerTimeMs").and_then(|v| v.as_u64()).unwrap_or(0),
            opponent_time_ms: d.get("opponentTimeMs").and_then(|v| v.as_u64()).unwrap_or(0),
            winner_id: d.get("winnerId").and_then(|v| v.as_str()).map(|s| s.to_string()),
            expires_at: parse_timestamp_json(d.get("expiresAt").ok_or(format!("Duel {}: missing expiresAt", i))?)?,
            started_at: parse_optional_timestamp(d.get("startedAt"))?,
            completed_at: parse_optional_timestamp(d.get("completedAt"))?,
            created_at: parse_timestamp_json(d.get("createdAt").ok_or(format!("Duel {}: missing createdAt", i))?)?,
        };

        ctx.db.duel().insert(record);
        count += 1;
    }

    log::info!("✅ Restored {} duel records", count);
    Ok(())
}

/// Bulk restore duel_word table from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_duel_word(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_duel_word attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let words = data.as_array()
        .ok_or("Expected JSON array of duel_word records")?;

    let mut count = 0;
    for (i, w) in words.iter().enumerate() {
        let word = DuelWord {
            id: 0, // auto_inc
            duel_id: w.get("duelId").and_then(|v| v.as_u64()).ok_or(format!("DuelWord {}: missing duelId", i))?,
            word_index: w.get("wordIndex").and_then(|v| v.as_u64()).ok_or(format!("DuelWord {}: missing wordIndex", i))? as u32,
            word_id: w.get("wordId").and_then(|v| v.as_u64()).ok_or(format!("DuelWord {}: missing wordId", i))?,
            prompt: w.get("prompt").and_then(|v| v.as_str()).ok_or(format!("DuelWord {}: missing prompt", i))?.to_string(),
            expected_answer: w.get("expectedAnswer").and_then(|v| v.as_str()).ok_or(format!("DuelWord {}: missing expectedAnswer", i))?.to_string(),
        };

        ctx.db.duel_word().insert(word);
        count += 1;
    }

    log::info!("✅ Restored {} duel_word records", count);
    Ok(())
}

/// Bulk restore duel_response table from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_duel_response(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_duel_response attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let responses = data.as_array()
        .ok_or("Expected JSON array of duel_response records")?;

    let mut count = 0;
    for (i, r) in responses.iter().enumerate() {
        let response = DuelResponse {
            id: 0, // auto_inc
            duel_id: r.get("duelId").and_then(|v| v.as_u64()).ok_or(format!("Response {}: missing duelId", i))?,
            user_id: r.get("userId").and_then(|v| v.as_str()).ok_or(format!("Response {}: missing userId", i))?.to_string(),
            word_index: r.get("wordIndex").and_then(|v| v.as_u64()).ok_or(format!("Response {}: missing wordIndex", i))? as u32,
            is_correct: r.get("isCorrect").and_then(|v| v.as_bool()).ok_or(format!("Response {}: missing isCorrect", i))?,
            response_time_ms: r.get("responseTimeMs").and_then(|v| v.as_u64()).ok_or(format!("Response {}: missing responseTimeMs", i))? as u32,
            submitted_at: parse_timestamp_json(r.get("submittedAt").ok_or(format!("Response {}: missing submittedAt", i))?)?,
        };

        ctx.db.duel_response().insert(response);
        count += 1;
    }

    log::info!("✅ Restored {} duel_response records", count);
    Ok(())
}

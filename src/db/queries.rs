use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::models::{AttemptStatus, Booking, BookingStatus, Gateway, PaymentAttempt};

const DT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn fmt_dt(dt: &NaiveDateTime) -> String {
    dt.format(DT_FORMAT).to_string()
}

fn parse_dt(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, DT_FORMAT).unwrap_or_else(|_| Utc::now().naive_utc())
}

fn parse_opt_dt(s: Option<String>) -> Option<NaiveDateTime> {
    s.map(|v| parse_dt(&v))
}

// ── Bookings ──

const BOOKING_COLS: &str = "id, user_id, station_id, charger_id, slot_start, slot_end, amount, \
     currency, status, active_attempt_id, version, created_at, updated_at";

fn booking_from_row(row: &Row) -> rusqlite::Result<Booking> {
    Ok(Booking {
        id: row.get(0)?,
        user_id: row.get(1)?,
        station_id: row.get(2)?,
        charger_id: row.get(3)?,
        slot_start: parse_dt(&row.get::<_, String>(4)?),
        slot_end: parse_dt(&row.get::<_, String>(5)?),
        amount: row.get(6)?,
        currency: row.get(7)?,
        status: BookingStatus::from_str(&row.get::<_, String>(8)?),
        active_attempt_id: row.get(9)?,
        version: row.get(10)?,
        created_at: parse_dt(&row.get::<_, String>(11)?),
        updated_at: parse_dt(&row.get::<_, String>(12)?),
    })
}

pub fn insert_booking(conn: &Connection, booking: &Booking) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO bookings (id, user_id, station_id, charger_id, slot_start, slot_end, amount, \
         currency, status, active_attempt_id, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            booking.id,
            booking.user_id,
            booking.station_id,
            booking.charger_id,
            fmt_dt(&booking.slot_start),
            fmt_dt(&booking.slot_end),
            booking.amount,
            booking.currency,
            booking.status.as_str(),
            booking.active_attempt_id,
            booking.version,
            fmt_dt(&booking.created_at),
            fmt_dt(&booking.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_booking(conn: &Connection, id: &str) -> rusqlite::Result<Option<Booking>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {BOOKING_COLS} FROM bookings WHERE id = ?1"))?;
    let mut rows = stmt.query_map(params![id], booking_from_row)?;
    rows.next().transpose()
}

/// Conditional status update: only fires when the row still carries the
/// version the caller read and sits in one of the allowed source states.
/// Returns the number of rows changed; zero means the caller lost the race.
pub fn update_booking_status(
    conn: &Connection,
    id: &str,
    allowed_from: &[BookingStatus],
    to: BookingStatus,
    expected_version: i64,
    active_attempt_id: Option<&str>,
    now: &NaiveDateTime,
) -> rusqlite::Result<usize> {
    // allowed_from values are the enum's own static strings, not user input
    let from_list = allowed_from
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",");

    conn.execute(
        &format!(
            "UPDATE bookings SET status = ?1, active_attempt_id = ?2, version = version + 1, \
             updated_at = ?3 WHERE id = ?4 AND version = ?5 AND status IN ({from_list})"
        ),
        params![to.as_str(), active_attempt_id, fmt_dt(now), id, expected_version],
    )
}

pub fn bookings_to_start(conn: &Connection, now: &NaiveDateTime) -> rusqlite::Result<Vec<Booking>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BOOKING_COLS} FROM bookings \
         WHERE status = 'confirmed' AND slot_start <= ?1 AND slot_end > ?1"
    ))?;
    let rows = stmt.query_map(params![fmt_dt(now)], booking_from_row)?;
    rows.collect()
}

pub fn bookings_to_complete(
    conn: &Connection,
    now: &NaiveDateTime,
) -> rusqlite::Result<Vec<Booking>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BOOKING_COLS} FROM bookings \
         WHERE status IN ('confirmed', 'in_progress') AND slot_end <= ?1"
    ))?;
    let rows = stmt.query_map(params![fmt_dt(now)], booking_from_row)?;
    rows.collect()
}

// ── Payment attempts ──

const ATTEMPT_COLS: &str = "id, booking_id, gateway, external_ref, status, attempt_number, \
     amount, currency, failure_reason, raw_callback_payload, last_lookup_at, created_at, updated_at";

fn attempt_from_row(row: &Row) -> rusqlite::Result<PaymentAttempt> {
    let gateway_str: String = row.get(2)?;
    let gateway = Gateway::parse(&gateway_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown gateway: {gateway_str}").into(),
        )
    })?;

    Ok(PaymentAttempt {
        id: row.get(0)?,
        booking_id: row.get(1)?,
        gateway,
        external_ref: row.get(3)?,
        status: AttemptStatus::from_str(&row.get::<_, String>(4)?),
        attempt_number: row.get(5)?,
        amount: row.get(6)?,
        currency: row.get(7)?,
        failure_reason: row.get(8)?,
        raw_callback_payload: row.get(9)?,
        last_lookup_at: parse_opt_dt(row.get(10)?),
        created_at: parse_dt(&row.get::<_, String>(11)?),
        updated_at: parse_dt(&row.get::<_, String>(12)?),
    })
}

pub fn insert_attempt(conn: &Connection, attempt: &PaymentAttempt) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO payment_attempts (id, booking_id, gateway, external_ref, status, \
         attempt_number, amount, currency, failure_reason, raw_callback_payload, last_lookup_at, \
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            attempt.id,
            attempt.booking_id,
            attempt.gateway.as_str(),
            attempt.external_ref,
            attempt.status.as_str(),
            attempt.attempt_number,
            attempt.amount,
            attempt.currency,
            attempt.failure_reason,
            attempt.raw_callback_payload,
            attempt.last_lookup_at.as_ref().map(fmt_dt),
            fmt_dt(&attempt.created_at),
            fmt_dt(&attempt.updated_at),
        ],
    )?;
    Ok(())
}

pub fn attempt_by_ref(
    conn: &Connection,
    external_ref: &str,
) -> rusqlite::Result<Option<PaymentAttempt>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTEMPT_COLS} FROM payment_attempts WHERE external_ref = ?1"
    ))?;
    let mut rows = stmt.query_map(params![external_ref], attempt_from_row)?;
    rows.next().transpose()
}

pub fn attempt_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<PaymentAttempt>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTEMPT_COLS} FROM payment_attempts WHERE id = ?1"
    ))?;
    let mut rows = stmt.query_map(params![id], attempt_from_row)?;
    rows.next().transpose()
}

pub fn attempts_for_booking(
    conn: &Connection,
    booking_id: &str,
) -> rusqlite::Result<Vec<PaymentAttempt>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTEMPT_COLS} FROM payment_attempts WHERE booking_id = ?1 \
         ORDER BY attempt_number DESC"
    ))?;
    let rows = stmt.query_map(params![booking_id], attempt_from_row)?;
    rows.collect()
}

pub fn attempt_count(conn: &Connection, booking_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM payment_attempts WHERE booking_id = ?1",
        params![booking_id],
        |row| row.get(0),
    )
}

/// Marks a live attempt as seen by a lookup that came back non-terminal.
pub fn record_lookup(
    conn: &Connection,
    external_ref: &str,
    now: &NaiveDateTime,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE payment_attempts SET status = 'pending', last_lookup_at = ?1, updated_at = ?1 \
         WHERE external_ref = ?2 AND status IN ('initiated', 'pending')",
        params![fmt_dt(now), external_ref],
    )
}

/// Moves a live attempt into a terminal state. The status guard makes
/// terminal attempts immutable: a second writer changes zero rows.
pub fn finish_attempt(
    conn: &Connection,
    external_ref: &str,
    to: AttemptStatus,
    failure_reason: Option<&str>,
    now: &NaiveDateTime,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE payment_attempts SET status = ?1, failure_reason = ?2, last_lookup_at = ?3, \
         updated_at = ?3 WHERE external_ref = ?4 AND status IN ('initiated', 'pending')",
        params![to.as_str(), failure_reason, fmt_dt(now), external_ref],
    )
}

/// Audit copy of the raw webhook body. Stored verbatim, never interpreted.
pub fn record_webhook_payload(
    conn: &Connection,
    external_ref: &str,
    raw_payload: &str,
    now: &NaiveDateTime,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE payment_attempts SET raw_callback_payload = ?1, updated_at = ?2 \
         WHERE external_ref = ?3",
        params![raw_payload, fmt_dt(now), external_ref],
    )
}

pub fn stale_attempts(
    conn: &Connection,
    cutoff: &NaiveDateTime,
) -> rusqlite::Result<Vec<PaymentAttempt>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTEMPT_COLS} FROM payment_attempts \
         WHERE status IN ('initiated', 'pending') AND updated_at <= ?1 \
         ORDER BY updated_at ASC"
    ))?;
    let rows = stmt.query_map(params![fmt_dt(cutoff)], attempt_from_row)?;
    rows.collect()
}

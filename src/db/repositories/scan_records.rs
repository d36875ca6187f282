use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};

use crate::db::{
    helpers::{from_epoch_ms, parse_buid, to_epoch_ms, to_u32},
    models::{Exposure, ScanRecord},
    Database,
};

const SELECT_COLUMNS: &str =
    "SELECT id, buid, timestamp_start, timestamp_end, avg_rssi, med_rssi, rssi_count FROM scan_data";

fn row_to_scan_record(row: &Row) -> Result<ScanRecord> {
    let buid: String = row.get("buid")?;
    let timestamp_start: i64 = row.get("timestamp_start")?;
    let timestamp_end: i64 = row.get("timestamp_end")?;
    let rssi_count: i64 = row.get("rssi_count")?;

    Ok(ScanRecord {
        id: Some(row.get("id")?),
        buid: parse_buid(&buid, "buid")?,
        timestamp_start: from_epoch_ms(timestamp_start, "timestamp_start")?,
        timestamp_end: from_epoch_ms(timestamp_end, "timestamp_end")?,
        avg_rssi: row.get("avg_rssi")?,
        med_rssi: row.get("med_rssi")?,
        rssi_count: to_u32(rssi_count, "rssi_count")?,
    })
}

fn insert_row(conn: &Connection, record: &ScanRecord) -> Result<i64> {
    conn.execute(
        "INSERT INTO scan_data (buid, timestamp_start, timestamp_end, avg_rssi, med_rssi, rssi_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.buid.to_hex(),
            to_epoch_ms(record.timestamp_start),
            to_epoch_ms(record.timestamp_end),
            record.avg_rssi,
            record.med_rssi,
            record.rssi_count,
        ],
    )
    .with_context(|| format!("failed to insert scan record for {}", record.buid))?;
    Ok(conn.last_insert_rowid())
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ScanRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(row_to_scan_record(row)?);
    }
    Ok(records)
}

impl Database {
    pub async fn insert_scan_record(&self, record: &ScanRecord) -> Result<i64> {
        let record = record.clone();
        self.execute(move |conn| insert_row(conn, &record)).await
    }

    /// Writes all records in one transaction; ids come back in input order.
    pub async fn insert_scan_records(&self, records: Vec<ScanRecord>) -> Result<Vec<i64>> {
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open scan record transaction")?;
            let mut ids = Vec::with_capacity(records.len());
            for record in &records {
                ids.push(insert_row(&tx, record)?);
            }
            tx.commit().context("failed to commit scan records")?;
            Ok(ids)
        })
        .await
    }

    pub async fn list_scan_records(&self) -> Result<Vec<ScanRecord>> {
        self.execute(|conn| query_records(conn, &format!("{SELECT_COLUMNS} ORDER BY id ASC"), []))
            .await
    }

    pub async fn list_scan_records_desc(&self) -> Result<Vec<ScanRecord>> {
        self.execute(|conn| {
            query_records(
                conn,
                &format!("{SELECT_COLUMNS} ORDER BY timestamp_end DESC, id DESC"),
                [],
            )
        })
        .await
    }

    pub async fn list_scan_records_since(&self, since: DateTime<Utc>) -> Result<Vec<ScanRecord>> {
        let since = to_epoch_ms(since);
        self.execute(move |conn| {
            query_records(
                conn,
                &format!("{SELECT_COLUMNS} WHERE timestamp_end > ?1 ORDER BY id ASC"),
                params![since],
            )
        })
        .await
    }

    pub async fn count_distinct_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let since = to_epoch_ms(since);
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT buid) FROM scan_data WHERE timestamp_end > ?1",
                params![since],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// Peers whose records since `since` with median RSSI at or above
    /// `rssi_threshold` add up to more than `min_minutes` of contact.
    pub async fn query_critical(
        &self,
        since: DateTime<Utc>,
        rssi_threshold: i32,
        min_minutes: u32,
    ) -> Result<Vec<Exposure>> {
        let since = to_epoch_ms(since);
        let min_ms = i64::from(min_minutes) * 60_000;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT buid, exposure_ms FROM (
                     SELECT buid, SUM(timestamp_end - timestamp_start) AS exposure_ms
                     FROM scan_data
                     WHERE timestamp_end > ?1 AND med_rssi >= ?2
                     GROUP BY buid
                 )
                 WHERE exposure_ms > ?3
                 ORDER BY exposure_ms DESC, buid ASC",
            )?;
            let mut rows = stmt.query(params![since, rssi_threshold, min_ms])?;
            let mut exposures = Vec::new();
            while let Some(row) = rows.next()? {
                let buid: String = row.get(0)?;
                exposures.push(Exposure {
                    buid: parse_buid(&buid, "buid")?,
                    exposure_ms: row.get(1)?,
                });
            }
            Ok(exposures)
        })
        .await
    }

    pub async fn delete_scan_record(&self, id: i64) -> Result<bool> {
        self.execute(move |conn| {
            let deleted = conn
                .execute("DELETE FROM scan_data WHERE id = ?1", params![id])
                .with_context(|| format!("failed to delete scan record {id}"))?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn delete_older_than(&self, timestamp: DateTime<Utc>) -> Result<usize> {
        let timestamp = to_epoch_ms(timestamp);
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM scan_data WHERE timestamp_end < ?1",
                params![timestamp],
            )
            .context("failed to delete old scan records")
        })
        .await
    }

    pub async fn clear_scan_records(&self) -> Result<usize> {
        self.execute(|conn| {
            conn.execute("DELETE FROM scan_data", [])
                .context("failed to clear scan records")
        })
        .await
    }

    /// Drops everything that ended before the retention window.
    pub async fn prune_expired(&self, now: DateTime<Utc>, retention_days: u32) -> Result<usize> {
        let cutoff = now - Duration::days(i64::from(retention_days));
        self.delete_older_than(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Buid;
    use pretty_assertions::assert_eq;

    fn t(minutes: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + Duration::minutes(minutes)
    }

    fn buid(hex: &str) -> Buid {
        hex.parse().unwrap()
    }

    fn record(hex: &str, start: i64, end: i64, med_rssi: i32) -> ScanRecord {
        ScanRecord {
            id: None,
            buid: buid(hex),
            timestamp_start: t(start),
            timestamp_end: t(end),
            avg_rssi: med_rssi,
            med_rssi,
            rssi_count: 3,
        }
    }

    const A: &str = "0a0a0a0a0a0a0a0a0a0a";
    const B: &str = "0b0b0b0b0b0b0b0b0b0b";

    #[tokio::test]
    async fn inserted_records_read_back_in_order() {
        let db = Database::in_memory().unwrap();
        let first = db.insert_scan_record(&record(A, 0, 5, -60)).await.unwrap();
        let ids = db
            .insert_scan_records(vec![record(B, 1, 9, -70), record(A, 6, 7, -65)])
            .await
            .unwrap();
        assert_eq!(ids, vec![first + 1, first + 2]);

        let records = db.list_scan_records().await.unwrap();
        let mut expected = record(A, 0, 5, -60);
        expected.id = Some(first);
        assert_eq!(records[0], expected);
        assert_eq!(records.len(), 3);

        let desc: Vec<i64> = db
            .list_scan_records_desc()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.timestamp_end.timestamp())
            .collect();
        assert_eq!(desc, vec![t(9).timestamp(), t(7).timestamp(), t(5).timestamp()]);
    }

    #[tokio::test]
    async fn empty_batch_inserts_nothing() {
        let db = Database::in_memory().unwrap();
        assert!(db.insert_scan_records(Vec::new()).await.unwrap().is_empty());
        assert!(db.list_scan_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn critical_exposure_sums_qualifying_records() {
        let db = Database::in_memory().unwrap();
        db.insert_scan_records(vec![
            record(A, 0, 10, -70),
            record(A, 20, 26, -72),
            // too weak, ignored
            record(A, 30, 60, -80),
            record(B, 0, 10, -60),
        ])
        .await
        .unwrap();

        let exposures = db.query_critical(t(-1), -75, 15).await.unwrap();
        assert_eq!(
            exposures,
            vec![Exposure {
                buid: buid(A),
                exposure_ms: 16 * 60_000,
            }]
        );

        // exactly the threshold does not qualify
        assert!(db.query_critical(t(-1), -75, 16).await.unwrap().is_empty());

        // records ending at `since` are excluded
        let later = db.query_critical(t(10), -75, 5).await.unwrap();
        assert_eq!(
            later,
            vec![Exposure {
                buid: buid(A),
                exposure_ms: 6 * 60_000,
            }]
        );
    }

    #[tokio::test]
    async fn since_queries_use_strict_bounds() {
        let db = Database::in_memory().unwrap();
        db.insert_scan_records(vec![
            record(A, 0, 5, -60),
            record(B, 0, 10, -60),
            record(B, 11, 12, -60),
        ])
        .await
        .unwrap();

        assert_eq!(db.list_scan_records_since(t(5)).await.unwrap().len(), 2);
        assert_eq!(db.count_distinct_since(t(4)).await.unwrap(), 2);
        assert_eq!(db.count_distinct_since(t(5)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deletion_and_retention() {
        let db = Database::in_memory().unwrap();
        let ids = db
            .insert_scan_records(vec![
                record(A, 0, 5, -60),
                record(B, 0, 10, -60),
                record(B, 20, 30, -60),
            ])
            .await
            .unwrap();

        assert_eq!(db.delete_older_than(t(10)).await.unwrap(), 1);
        assert!(db.delete_scan_record(ids[1]).await.unwrap());
        assert!(!db.delete_scan_record(ids[1]).await.unwrap());

        let now = t(30) + Duration::days(14);
        assert_eq!(db.prune_expired(now, 14).await.unwrap(), 0);
        assert_eq!(
            db.prune_expired(now + Duration::minutes(1), 14).await.unwrap(),
            1
        );

        db.insert_scan_record(&record(A, 0, 1, -60)).await.unwrap();
        assert_eq!(db.clear_scan_records().await.unwrap(), 1);
        assert!(db.list_scan_records().await.unwrap().is_empty());
    }
}

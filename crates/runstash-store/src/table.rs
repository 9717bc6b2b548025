//! redb table definitions and the record table
//!
//! One database file holds three tables:
//!
//! - `records`: id bytes -> postcard [`StoredRow`]
//! - `run_keys`: run key bytes -> id bytes (the run key uniqueness constraint)
//! - `created_index`: created_at ++ id -> empty (ordering for retention and listing)
//!
//! Every operation is available on [`RecordView`] so several of them can be
//! composed inside one transaction, and as a standalone method on
//! [`RecordTable`] that opens its own.

use std::ops::Bound;
use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{
    Database, ReadOnlyTable, ReadableTable, ReadableTableMetadata, Table, TableDefinition,
    WriteTransaction,
};
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::record::{ListFilter, Record, StoredRow, from_millis};

type Bytes = &'static [u8];

// Key: record id (16 raw uuid bytes), Value: serialized StoredRow
pub const RECORDS: TableDefinition<Bytes, Bytes> = TableDefinition::new("records");

// Key: run key (utf-8), Value: record id
pub const RUN_KEYS: TableDefinition<Bytes, Bytes> = TableDefinition::new("run_keys");

// Key: (created_at, id) concatenated, Value: empty
pub const CREATED_INDEX: TableDefinition<Bytes, Bytes> = TableDefinition::new("created_index");

const EMPTY: &[u8] = &[];

/// Width of the timestamp prefix in `created_index` keys
const TS_LEN: usize = 8;

/// Order-preserving encoding of a signed millisecond timestamp
fn ts_prefix(millis: i64) -> [u8; TS_LEN] {
    ((millis as u64) ^ (1 << 63)).to_be_bytes()
}

fn ts_from_prefix(key: &[u8]) -> StoreResult<i64> {
    let prefix: [u8; TS_LEN] = key
        .get(..TS_LEN)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| StoreError::deserialization("truncated created_index key"))?;
    Ok((u64::from_be_bytes(prefix) ^ (1 << 63)) as i64)
}

fn index_key(created_at: DateTime<Utc>, id: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(TS_LEN + 16);
    key.extend_from_slice(&ts_prefix(created_at.timestamp_millis()));
    key.extend_from_slice(id.as_bytes());
    key
}

/// The three record tables, opened in one transaction
///
/// Read operations work for both read-only and write transactions; the
/// mutating ones are only available on [`RecordTxn`].
pub struct RecordView<T> {
    records: T,
    run_keys: T,
    created: T,
}

/// Tables opened inside a write transaction
pub type RecordTxn<'txn> = RecordView<Table<'txn, Bytes, Bytes>>;

/// Tables opened inside a read transaction
pub type RecordReader = RecordView<ReadOnlyTable<Bytes, Bytes>>;

impl<T> RecordView<T>
where
    T: ReadableTable<Bytes, Bytes>,
{
    fn load(&self, id: &[u8]) -> StoreResult<Option<StoredRow>> {
        match self.records.get(id)? {
            Some(bytes) => Ok(Some(StoredRow::decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn id_for(&self, run_key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .run_keys
            .get(run_key.as_bytes())?
            .map(|id| id.value().to_vec()))
    }

    /// Look up a record by run key
    pub fn get_by_key(&self, run_key: &str) -> StoreResult<Option<Record>> {
        match self.id_for(run_key)? {
            Some(id) => self.load(&id)?.map(StoredRow::into_record).transpose(),
            None => Ok(None),
        }
    }

    /// Look up a record by id
    pub fn get_by_id(&self, id: &Uuid) -> StoreResult<Option<Record>> {
        self.load(id.as_bytes())?
            .map(StoredRow::into_record)
            .transpose()
    }

    /// Total number of records
    pub fn count(&self) -> StoreResult<u64> {
        Ok(self.records.len()?)
    }

    /// Number of records with `start <= created_at <= end`
    pub fn count_matching(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> StoreResult<u64> {
        let (lower, upper) = created_bounds(start, end);
        let mut count = 0;
        for entry in self.created.range::<&[u8]>((as_bound(&lower), as_bound(&upper)))? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Filtered page of records, newest first, plus the unpaged match count
    pub fn list(
        &self,
        filter: &ListFilter,
        limit: usize,
        offset: usize,
    ) -> StoreResult<(Vec<Record>, u64)> {
        if let Some(run_key) = &filter.run_key {
            let matched: Vec<Record> = self
                .get_by_key(run_key)?
                .filter(|record| filter.matches(record))
                .into_iter()
                .collect();
            let total = matched.len() as u64;
            let page = matched.into_iter().skip(offset).take(limit).collect();
            return Ok((page, total));
        }

        let (lower, upper) = created_bounds(filter.start, filter.end);
        let range = self
            .created
            .range::<&[u8]>((as_bound(&lower), as_bound(&upper)))?;

        let mut page = Vec::with_capacity(limit.min(1024));
        let mut total: u64 = 0;
        for entry in range.rev() {
            let (key, _) = entry?;
            let position = total as usize;
            total += 1;
            if position < offset || position >= offset.saturating_add(limit) {
                continue;
            }
            if let Some(row) = self.load(&key.value()[TS_LEN..])? {
                page.push(row.into_record()?);
            }
        }

        Ok((page, total))
    }

    /// Creation time of the oldest record
    pub fn oldest_created(&self) -> StoreResult<Option<DateTime<Utc>>> {
        match self.created.first()? {
            Some((key, _)) => Ok(Some(from_millis(ts_from_prefix(key.value())?)?)),
            None => Ok(None),
        }
    }

    /// Creation time of the newest record
    pub fn newest_created(&self) -> StoreResult<Option<DateTime<Utc>>> {
        match self.created.last()? {
            Some((key, _)) => Ok(Some(from_millis(ts_from_prefix(key.value())?)?)),
            None => Ok(None),
        }
    }
}

impl<'txn> RecordTxn<'txn> {
    fn open(txn: &'txn WriteTransaction) -> StoreResult<Self> {
        Ok(Self {
            records: txn.open_table(RECORDS)?,
            run_keys: txn.open_table(RUN_KEYS)?,
            created: txn.open_table(CREATED_INDEX)?,
        })
    }

    /// Insert a new record
    ///
    /// Fails with [`StoreError::ConstraintViolation`] if the run key or the
    /// id is already taken.
    pub fn insert(&mut self, record: &Record) -> StoreResult<()> {
        if self.run_keys.get(record.run_key.as_bytes())?.is_some() {
            return Err(StoreError::constraint(format!(
                "run key already exists: {}",
                record.run_key
            )));
        }
        if self.records.get(record.id.as_bytes().as_slice())?.is_some() {
            return Err(StoreError::constraint(format!(
                "record id already exists: {}",
                record.id
            )));
        }

        let row = StoredRow::from_record(record)?.encode()?;
        let id = record.id.as_bytes().as_slice();
        self.records.insert(id, row.as_slice())?;
        self.run_keys.insert(record.run_key.as_bytes(), id)?;
        self.created
            .insert(index_key(record.created_at, &record.id).as_slice(), EMPTY)?;

        debug!(run_key = %record.run_key, id = %record.id, "Inserted record");
        Ok(())
    }

    /// Overwrite the payload of an existing record
    ///
    /// Returns false if no record has this run key.
    pub fn update_payload(
        &mut self,
        run_key: &str,
        payload: &Value,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let Some(id) = self.id_for(run_key)? else {
            return Ok(false);
        };
        let Some(mut row) = self.load(&id)? else {
            return Ok(false);
        };

        row.payload = serde_json::to_string(payload)?;
        row.updated_at = updated_at.timestamp_millis();
        self.records.insert(id.as_slice(), row.encode()?.as_slice())?;
        Ok(true)
    }

    /// Delete a record by run key; true iff one existed
    pub fn delete(&mut self, run_key: &str) -> StoreResult<bool> {
        let id = match self.run_keys.remove(run_key.as_bytes())? {
            Some(id) => id.value().to_vec(),
            None => return Ok(false),
        };
        let row = match self.records.remove(id.as_slice())? {
            Some(bytes) => StoredRow::decode(bytes.value())?,
            None => return Ok(true),
        };

        let mut key = ts_prefix(row.created_at).to_vec();
        key.extend_from_slice(&id);
        self.created.remove(key.as_slice())?;
        Ok(true)
    }

    /// Remove the record behind a `created_index` key from all three tables
    fn remove_indexed(&mut self, key: &[u8]) -> StoreResult<()> {
        self.created.remove(key)?;
        let row = match self.records.remove(&key[TS_LEN..])? {
            Some(bytes) => StoredRow::decode(bytes.value())?,
            None => return Ok(()),
        };
        self.run_keys.remove(row.run_key.as_bytes())?;
        Ok(())
    }

    /// Delete every record created strictly before `cutoff`
    pub fn delete_older_than(&mut self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let upper = ts_prefix(cutoff.timestamp_millis());
        let keys = self
            .created
            .range::<&[u8]>(..upper.as_slice())?
            .map(|entry| entry.map(|(key, _)| key.value().to_vec()))
            .collect::<Result<Vec<_>, _>>()?;

        for key in &keys {
            self.remove_indexed(key)?;
        }
        Ok(keys.len() as u64)
    }

    /// Delete the `n` oldest records (all of them if there are fewer)
    ///
    /// Ties on `created_at` are broken by id byte order.
    pub fn delete_oldest(&mut self, n: u64) -> StoreResult<u64> {
        if n == 0 {
            return Ok(0);
        }
        let keys = self
            .created
            .iter()?
            .take(usize::try_from(n).unwrap_or(usize::MAX))
            .map(|entry| entry.map(|(key, _)| key.value().to_vec()))
            .collect::<Result<Vec<_>, _>>()?;

        for key in &keys {
            self.remove_indexed(key)?;
        }
        Ok(keys.len() as u64)
    }
}

fn created_bounds(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> (Bound<[u8; TS_LEN]>, Bound<[u8; TS_LEN]>) {
    let lower = match start {
        Some(start) => Bound::Included(ts_prefix(start.timestamp_millis())),
        None => Bound::Unbounded,
    };
    // Keys carry an id suffix, so "<= end" becomes "< end + 1ms".
    let upper = match end {
        Some(end) => Bound::Excluded(ts_prefix(end.timestamp_millis().saturating_add(1))),
        None => Bound::Unbounded,
    };
    (lower, upper)
}

fn as_bound(bound: &Bound<[u8; TS_LEN]>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_slice()),
        Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// The persistent record table
pub struct RecordTable {
    db: Database,
}

impl RecordTable {
    /// Open or create the database and its tables
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        info!("Opened record database");

        let table = Self { db };
        table.init_tables()?;
        Ok(table)
    }

    /// Create tables if they don't exist
    fn init_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write()?;
        txn.open_table(RECORDS)?;
        txn.open_table(RUN_KEYS)?;
        txn.open_table(CREATED_INDEX)?;
        txn.commit()?;

        debug!("Initialized record tables");
        Ok(())
    }

    /// Run `f` against a consistent snapshot
    pub fn read<T>(&self, f: impl FnOnce(&RecordReader) -> StoreResult<T>) -> StoreResult<T> {
        let txn = self.db.begin_read()?;
        let view = RecordView {
            records: txn.open_table(RECORDS)?,
            run_keys: txn.open_table(RUN_KEYS)?,
            created: txn.open_table(CREATED_INDEX)?,
        };
        f(&view)
    }

    /// Run `f` in a write transaction, committing only if it succeeds
    ///
    /// redb admits one write transaction at a time, so `f` never interleaves
    /// with another writer.
    pub fn write<T>(&self, f: impl FnOnce(&mut RecordTxn<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let txn = self.db.begin_write()?;
        let out = {
            let mut view = RecordTxn::open(&txn)?;
            f(&mut view)?
        };
        txn.commit()?;
        Ok(out)
    }

    pub fn get_by_key(&self, run_key: &str) -> StoreResult<Option<Record>> {
        self.read(|view| view.get_by_key(run_key))
    }

    pub fn get_by_id(&self, id: &Uuid) -> StoreResult<Option<Record>> {
        self.read(|view| view.get_by_id(id))
    }

    pub fn insert(&self, record: &Record) -> StoreResult<()> {
        self.write(|txn| txn.insert(record))
    }

    pub fn update_payload(
        &self,
        run_key: &str,
        payload: &Value,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.write(|txn| txn.update_payload(run_key, payload, updated_at))
    }

    pub fn delete(&self, run_key: &str) -> StoreResult<bool> {
        self.write(|txn| txn.delete(run_key))
    }

    pub fn count(&self) -> StoreResult<u64> {
        self.read(|view| view.count())
    }

    pub fn count_matching(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> StoreResult<u64> {
        self.read(|view| view.count_matching(start, end))
    }

    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.write(|txn| txn.delete_older_than(cutoff))
    }

    pub fn delete_oldest(&self, n: u64) -> StoreResult<u64> {
        self.write(|txn| txn.delete_oldest(n))
    }

    pub fn list(
        &self,
        filter: &ListFilter,
        limit: usize,
        offset: usize,
    ) -> StoreResult<(Vec<Record>, u64)> {
        self.read(|view| view.list(filter, limit, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_table() -> (RecordTable, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let table = RecordTable::open(temp_dir.path().join("test.redb")).unwrap();
        (table, temp_dir)
    }

    fn record_at(run_key: &str, created_at: DateTime<Utc>) -> Record {
        Record::new(run_key, json!([{ "run": run_key }]), created_at).with_created_at(created_at)
    }

    #[test]
    fn test_ts_prefix_preserves_order() {
        let samples = [-5_000i64, -1, 0, 1, 1_700_000_000_000];
        for pair in samples.windows(2) {
            assert!(ts_prefix(pair[0]) < ts_prefix(pair[1]));
            assert_eq!(ts_from_prefix(&ts_prefix(pair[0])).unwrap(), pair[0]);
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let (table, _temp) = create_test_table();
        let record = record_at("run-a", Utc::now());

        table.insert(&record).unwrap();

        assert_eq!(table.get_by_key("run-a").unwrap(), Some(record.clone()));
        assert_eq!(table.get_by_id(&record.id).unwrap(), Some(record));
        assert_eq!(table.get_by_key("run-b").unwrap(), None);
        assert_eq!(table.count().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_run_key_is_constraint_violation() {
        let (table, _temp) = create_test_table();
        table.insert(&record_at("dup", Utc::now())).unwrap();

        let err = table.insert(&record_at("dup", Utc::now())).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        assert_eq!(table.count().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_id_is_constraint_violation() {
        let (table, _temp) = create_test_table();
        let first = record_at("one", Utc::now());
        table.insert(&first).unwrap();

        let mut second = record_at("two", Utc::now());
        second.id = first.id;
        let err = table.insert(&second).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        assert!(table.get_by_key("two").unwrap().is_none());
    }

    #[test]
    fn test_update_payload() {
        let (table, _temp) = create_test_table();
        let record = record_at("run-a", Utc::now() - Duration::minutes(1));
        table.insert(&record).unwrap();

        let later = Utc::now();
        assert!(table.update_payload("run-a", &json!({"done": true}), later).unwrap());

        let updated = table.get_by_key("run-a").unwrap().unwrap();
        assert_eq!(updated.payload, json!({"done": true}));
        assert_eq!(updated.created_at, record.created_at);
        assert_eq!(updated.updated_at.timestamp_millis(), later.timestamp_millis());

        assert!(!table.update_payload("missing", &json!(1), later).unwrap());
    }

    #[test]
    fn test_delete_clears_all_tables() {
        let (table, _temp) = create_test_table();
        let record = record_at("run-a", Utc::now());
        table.insert(&record).unwrap();

        assert!(table.delete("run-a").unwrap());
        assert!(!table.delete("run-a").unwrap());
        assert!(table.get_by_id(&record.id).unwrap().is_none());
        assert_eq!(table.count_matching(None, None).unwrap(), 0);

        // The run key is free again
        table.insert(&record_at("run-a", Utc::now())).unwrap();
    }

    #[test]
    fn test_delete_older_than_is_strict() {
        let (table, _temp) = create_test_table();
        let now = Utc::now();
        let cutoff = now - Duration::minutes(30);
        table.insert(&record_at("old", now - Duration::minutes(40))).unwrap();
        table.insert(&record_at("edge", cutoff)).unwrap();
        table.insert(&record_at("new", now)).unwrap();

        assert_eq!(table.delete_older_than(cutoff).unwrap(), 1);
        assert!(table.get_by_key("old").unwrap().is_none());
        assert!(table.get_by_key("edge").unwrap().is_some());
        assert_eq!(table.count().unwrap(), 2);
    }

    #[test]
    fn test_delete_oldest() {
        let (table, _temp) = create_test_table();
        let base = Utc::now() - Duration::minutes(10);
        for i in 0..5 {
            let key = format!("run-{i}");
            table.insert(&record_at(&key, base + Duration::seconds(i))).unwrap();
        }

        assert_eq!(table.delete_oldest(2).unwrap(), 2);
        assert!(table.get_by_key("run-0").unwrap().is_none());
        assert!(table.get_by_key("run-1").unwrap().is_none());
        assert!(table.get_by_key("run-2").unwrap().is_some());

        assert_eq!(table.delete_oldest(0).unwrap(), 0);
        assert_eq!(table.delete_oldest(10).unwrap(), 3);
        assert_eq!(table.count().unwrap(), 0);
    }

    #[test]
    fn test_list_orders_newest_first() {
        let (table, _temp) = create_test_table();
        let base = Utc::now() - Duration::minutes(10);
        for i in 0..4 {
            let key = format!("run-{i}");
            table.insert(&record_at(&key, base + Duration::seconds(i))).unwrap();
        }

        let (rows, total) = table.list(&ListFilter::default(), 10, 0).unwrap();
        assert_eq!(total, 4);
        let keys: Vec<_> = rows.iter().map(|r| r.run_key.as_str()).collect();
        assert_eq!(keys, ["run-3", "run-2", "run-1", "run-0"]);
    }

    #[test]
    fn test_list_filters_are_conjunctive() {
        let (table, _temp) = create_test_table();
        let base = Utc::now() - Duration::minutes(10);
        for i in 0..6 {
            let key = format!("run-{i}");
            table.insert(&record_at(&key, base + Duration::seconds(i))).unwrap();
        }

        let filter = ListFilter {
            run_key: None,
            start: Some(base + Duration::seconds(1)),
            end: Some(base + Duration::seconds(3)),
        };
        let (rows, total) = table.list(&filter, 10, 0).unwrap();
        assert_eq!(total, 3);
        assert_eq!(rows[0].run_key, "run-3");
        assert_eq!(rows[2].run_key, "run-1");
        assert_eq!(
            table.count_matching(filter.start, filter.end).unwrap(),
            3
        );

        let filter = ListFilter {
            run_key: Some("run-5".into()),
            ..filter
        };
        let (rows, total) = table.list(&filter, 10, 0).unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);

        let filter = ListFilter {
            run_key: Some("run-2".into()),
            ..filter
        };
        let (rows, total) = table.list(&filter, 10, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].run_key, "run-2");
    }

    #[test]
    fn test_created_bounds() {
        let (table, _temp) = create_test_table();
        assert!(table.read(|v| v.oldest_created()).unwrap().is_none());

        let base = Utc::now() - Duration::minutes(10);
        let first = record_at("a", base);
        let last = record_at("b", base + Duration::seconds(30));
        table.insert(&last).unwrap();
        table.insert(&first).unwrap();

        assert_eq!(table.read(|v| v.oldest_created()).unwrap(), Some(first.created_at));
        assert_eq!(table.read(|v| v.newest_created()).unwrap(), Some(last.created_at));
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let (table, _temp) = create_test_table();
        let result: StoreResult<()> = table.write(|txn| {
            txn.insert(&record_at("rolled-back", Utc::now()))?;
            Err(StoreError::invalid_input("abort"))
        });

        assert!(result.is_err());
        assert!(table.get_by_key("rolled-back").unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_records() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("runs.redb");
        let record = record_at("persisted", Utc::now());
        {
            let table = RecordTable::open(&path).unwrap();
            table.insert(&record).unwrap();
        }

        let table = RecordTable::open(&path).unwrap();
        assert_eq!(table.get_by_key("persisted").unwrap(), Some(record));
    }
}

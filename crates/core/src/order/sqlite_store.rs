//! SQLite-backed order store implementation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::{
    derive_order_status, status_message, Batch, BatchCreation, DeliveredFile, ItemScope,
    ItemStatus, Order, OrderFilter, OrderItem, OrderStatus, OrderStore, OrderType,
    PackagingState, StatusChange, StoreError, Subscription, SubscriptionStatus,
};

const ORDER_COLUMNS: &str = "id, order_type, status, status_info, ordered_by, reference, priority, delivery, options, extensions, packaging, submitted_at, updated_at, completed_at";
const ITEM_COLUMNS: &str = "id, order_id, batch_id, item_id, identifier, collection, options, status, status_info, attempts, file_id, created_at, updated_at, completed_at";
const SUBSCRIPTION_COLUMNS: &str = "id, order_id, owner, collection, options, begin_at, end_at, timeslot_secs, next_timeslot, status, created_at, updated_at";
const BATCH_COLUMNS: &str =
    "id, subscription_id, order_id, timeslot, status, materialized, created_at, updated_at";
const FILE_COLUMNS: &str = "id, order_id, order_item_id, location, created_at, expires_at, available, downloads, last_downloaded_at, expiry_warned";

/// SQLite-backed order store.
pub struct SqliteOrderStore {
    conn: Mutex<Connection>,
}

/// Fixed-width UTC timestamp, so that text comparison matches time order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn db<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(db)
}

fn from_json<T: serde::de::DeserializeOwned + Default>(s: &str) -> T {
    serde_json::from_str(s).unwrap_or_default()
}

impl SqliteOrderStore {
    /// Create a new SQLite order store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite order store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                order_type TEXT NOT NULL,
                status TEXT NOT NULL,
                status_info TEXT,
                ordered_by TEXT NOT NULL,
                reference TEXT,
                priority TEXT NOT NULL,
                delivery TEXT NOT NULL,
                options TEXT NOT NULL,
                extensions TEXT NOT NULL,
                packaging TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
            CREATE INDEX IF NOT EXISTS idx_orders_ordered_by ON orders(ordered_by);

            CREATE TABLE IF NOT EXISTS order_items (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                batch_id TEXT,
                item_id TEXT NOT NULL,
                identifier TEXT NOT NULL,
                collection TEXT NOT NULL,
                options TEXT NOT NULL,
                status TEXT NOT NULL,
                status_info TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                file_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_items_order ON order_items(order_id, seq);
            CREATE INDEX IF NOT EXISTS idx_items_batch ON order_items(batch_id, seq);

            CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                owner TEXT NOT NULL,
                collection TEXT NOT NULL,
                options TEXT NOT NULL,
                begin_at TEXT NOT NULL,
                end_at TEXT NOT NULL,
                timeslot_secs INTEGER NOT NULL,
                next_timeslot TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_subscriptions_status ON subscriptions(status);

            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                subscription_id TEXT NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
                order_id TEXT NOT NULL,
                timeslot TEXT NOT NULL,
                status TEXT NOT NULL,
                materialized INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(subscription_id, timeslot)
            );

            CREATE TABLE IF NOT EXISTS delivered_files (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                order_item_id TEXT,
                location TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                available INTEGER NOT NULL DEFAULT 1,
                downloads INTEGER NOT NULL DEFAULT 0,
                last_downloaded_at TEXT,
                expiry_warned INTEGER NOT NULL DEFAULT 0
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_files_item
                ON delivered_files(order_item_id) WHERE order_item_id IS NOT NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_files_package
                ON delivered_files(order_id) WHERE order_item_id IS NULL;
            CREATE INDEX IF NOT EXISTS idx_files_expiry ON delivered_files(available, expires_at);
            "#,
        )
        .map_err(db)?;

        Ok(())
    }

    fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
        let order_type: String = row.get(1)?;
        let status: String = row.get(2)?;
        let priority: String = row.get(6)?;
        let delivery: String = row.get(7)?;
        let options: String = row.get(8)?;
        let extensions: String = row.get(9)?;
        let packaging: String = row.get(10)?;
        let submitted_at: String = row.get(11)?;
        let updated_at: String = row.get(12)?;
        let completed_at: Option<String> = row.get(13)?;

        Ok(Order {
            id: row.get(0)?,
            order_type: OrderType::parse(&order_type).unwrap_or(OrderType::Product),
            status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Submitted),
            status_info: row.get(3)?,
            ordered_by: row.get(4)?,
            reference: row.get(5)?,
            priority: from_json(&priority),
            delivery: from_json(&delivery),
            options: from_json(&options),
            extensions: from_json(&extensions),
            packaging: from_json(&packaging),
            submitted_at: parse_ts(&submitted_at),
            updated_at: parse_ts(&updated_at),
            completed_at: completed_at.as_deref().map(parse_ts),
        })
    }

    fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<OrderItem> {
        let options: String = row.get(6)?;
        let status: String = row.get(7)?;
        let created_at: String = row.get(11)?;
        let updated_at: String = row.get(12)?;
        let completed_at: Option<String> = row.get(13)?;

        Ok(OrderItem {
            id: row.get(0)?,
            order_id: row.get(1)?,
            batch_id: row.get(2)?,
            item_id: row.get(3)?,
            identifier: row.get(4)?,
            collection: row.get(5)?,
            options: from_json::<BTreeMap<String, String>>(&options),
            status: ItemStatus::parse(&status).unwrap_or(ItemStatus::Submitted),
            status_info: row.get(8)?,
            attempts: row.get(9)?,
            file_id: row.get(10)?,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
            completed_at: completed_at.as_deref().map(parse_ts),
        })
    }

    fn row_to_subscription(row: &rusqlite::Row) -> rusqlite::Result<Subscription> {
        let options: String = row.get(4)?;
        let begin: String = row.get(5)?;
        let end: String = row.get(6)?;
        let timeslot_secs: i64 = row.get(7)?;
        let next_timeslot: String = row.get(8)?;
        let status: String = row.get(9)?;
        let created_at: String = row.get(10)?;
        let updated_at: String = row.get(11)?;

        Ok(Subscription {
            id: row.get(0)?,
            order_id: row.get(1)?,
            owner: row.get(2)?,
            collection: row.get(3)?,
            options: from_json(&options),
            begin: parse_ts(&begin),
            end: parse_ts(&end),
            timeslot_secs: timeslot_secs.max(0) as u64,
            next_timeslot: parse_ts(&next_timeslot),
            status: SubscriptionStatus::parse(&status).unwrap_or(SubscriptionStatus::Active),
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }

    fn row_to_batch(row: &rusqlite::Row) -> rusqlite::Result<Batch> {
        let timeslot: String = row.get(3)?;
        let status: String = row.get(4)?;
        let materialized: i64 = row.get(5)?;
        let created_at: String = row.get(6)?;
        let updated_at: String = row.get(7)?;

        Ok(Batch {
            id: row.get(0)?,
            subscription_id: row.get(1)?,
            order_id: row.get(2)?,
            timeslot: parse_ts(&timeslot),
            status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Submitted),
            materialized: materialized != 0,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }

    fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<DeliveredFile> {
        let created_at: String = row.get(4)?;
        let expires_at: String = row.get(5)?;
        let available: i64 = row.get(6)?;
        let last_downloaded_at: Option<String> = row.get(8)?;
        let expiry_warned: i64 = row.get(9)?;

        Ok(DeliveredFile {
            id: row.get(0)?,
            order_id: row.get(1)?,
            order_item_id: row.get(2)?,
            location: row.get(3)?,
            created_at: parse_ts(&created_at),
            expires_at: parse_ts(&expires_at),
            available: available != 0,
            downloads: row.get(7)?,
            last_downloaded_at: last_downloaded_at.as_deref().map(parse_ts),
            expiry_warned: expiry_warned != 0,
        })
    }

    fn build_where_clause(filter: &OrderFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(order_type) = filter.order_type {
            conditions.push("order_type = ?");
            params.push(Box::new(order_type.as_str()));
        }

        if let Some(ref ordered_by) = filter.ordered_by {
            conditions.push("ordered_by = ?");
            params.push(Box::new(ordered_by.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn query_order(conn: &Connection, id: &str) -> Result<Option<Order>, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM orders WHERE id = ?", ORDER_COLUMNS),
            params![id],
            Self::row_to_order,
        )
        .optional()
        .map_err(db)
    }

    fn query_item(conn: &Connection, id: &str) -> Result<Option<OrderItem>, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM order_items WHERE id = ?", ITEM_COLUMNS),
            params![id],
            Self::row_to_item,
        )
        .optional()
        .map_err(db)
    }

    fn query_subscription(conn: &Connection, id: &str) -> Result<Option<Subscription>, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM subscriptions WHERE id = ?", SUBSCRIPTION_COLUMNS),
            params![id],
            Self::row_to_subscription,
        )
        .optional()
        .map_err(db)
    }

    fn query_batch(conn: &Connection, id: &str) -> Result<Option<Batch>, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM batches WHERE id = ?", BATCH_COLUMNS),
            params![id],
            Self::row_to_batch,
        )
        .optional()
        .map_err(db)
    }

    fn query_file(conn: &Connection, id: &str) -> Result<Option<DeliveredFile>, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM delivered_files WHERE id = ?", FILE_COLUMNS),
            params![id],
            Self::row_to_file,
        )
        .optional()
        .map_err(db)
    }

    fn collect<T>(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
        map: fn(&rusqlite::Row) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        let mut stmt = conn.prepare(sql).map_err(db)?;
        let rows = stmt.query_map(params, map).map_err(db)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db)?);
        }
        Ok(out)
    }

    fn insert_item(conn: &Connection, seq: i64, item: &OrderItem) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO order_items (id, seq, order_id, batch_id, item_id, identifier, collection, options, status, status_info, attempts, file_id, created_at, updated_at, completed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                item.id,
                seq,
                item.order_id,
                item.batch_id,
                item.item_id,
                item.identifier,
                item.collection,
                to_json(&item.options)?,
                item.status.as_str(),
                item.status_info,
                item.attempts,
                item.file_id,
                ts(item.created_at),
                ts(item.updated_at),
                item.completed_at.map(ts),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(format!("order item {}", item.id))
            } else {
                db(e)
            }
        })?;
        Ok(())
    }

    fn insert_file(conn: &Connection, file: &DeliveredFile) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO delivered_files (id, order_id, order_item_id, location, created_at, expires_at, available, downloads, last_downloaded_at, expiry_warned) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                file.id,
                file.order_id,
                file.order_item_id,
                file.location,
                ts(file.created_at),
                ts(file.expires_at),
                file.available as i64,
                file.downloads,
                file.last_downloaded_at.map(ts),
                file.expiry_warned as i64,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(format!(
                    "delivered file for {}",
                    file.order_item_id.as_deref().unwrap_or(&file.order_id)
                ))
            } else {
                db(e)
            }
        })?;
        Ok(())
    }

    /// Turn a compare-and-set miss into `NotFound` or `Conflict`.
    fn cas_miss(
        conn: &Connection,
        table: &str,
        entity: &'static str,
        id: &str,
        expected: &str,
    ) -> StoreError {
        let actual: Result<Option<String>, _> = conn
            .query_row(
                &format!("SELECT status FROM {} WHERE id = ?", table),
                params![id],
                |row| row.get(0),
            )
            .optional();
        match actual {
            Ok(Some(actual)) => StoreError::Conflict {
                entity,
                id: id.to_string(),
                expected: expected.to_string(),
                actual,
            },
            Ok(None) => StoreError::not_found(entity, id),
            Err(e) => db(e),
        }
    }

    fn scope_statuses(conn: &Connection, scope: &ItemScope) -> Result<Vec<ItemStatus>, StoreError> {
        let sql = match scope {
            ItemScope::Order(_) => "SELECT status FROM order_items WHERE order_id = ? ORDER BY seq",
            ItemScope::Batch(_) => "SELECT status FROM order_items WHERE batch_id = ? ORDER BY seq",
        };
        let mut stmt = conn.prepare(sql).map_err(db)?;
        let rows = stmt
            .query_map(params![scope.id()], |row| row.get::<_, String>(0))
            .map_err(db)?;
        let mut statuses = Vec::new();
        for row in rows {
            let status = row.map_err(db)?;
            if let Some(status) = ItemStatus::parse(&status) {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    fn next_seq(conn: &Connection, order_id: &str) -> Result<i64, StoreError> {
        conn.query_row(
            "SELECT COALESCE(MAX(seq), -1) + 1 FROM order_items WHERE order_id = ?",
            params![order_id],
            |row| row.get(0),
        )
        .map_err(db)
    }
}

impl OrderStore for SqliteOrderStore {
    fn insert_order(
        &self,
        order: &Order,
        items: &[OrderItem],
        subscription: Option<&Subscription>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db)?;

        tx.execute(
            &format!(
                "INSERT INTO orders ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                ORDER_COLUMNS
            ),
            params![
                order.id,
                order.order_type.as_str(),
                order.status.as_str(),
                order.status_info,
                order.ordered_by,
                order.reference,
                to_json(&order.priority)?,
                to_json(&order.delivery)?,
                to_json(&order.options)?,
                to_json(&order.extensions)?,
                to_json(&order.packaging)?,
                ts(order.submitted_at),
                ts(order.updated_at),
                order.completed_at.map(ts),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(format!("order {}", order.id))
            } else {
                db(e)
            }
        })?;

        for (seq, item) in items.iter().enumerate() {
            Self::insert_item(&tx, seq as i64, item)?;
        }

        if let Some(sub) = subscription {
            tx.execute(
                &format!(
                    "INSERT INTO subscriptions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    SUBSCRIPTION_COLUMNS
                ),
                params![
                    sub.id,
                    sub.order_id,
                    sub.owner,
                    sub.collection,
                    to_json(&sub.options)?,
                    ts(sub.begin),
                    ts(sub.end),
                    sub.timeslot_secs as i64,
                    ts(sub.next_timeslot),
                    sub.status.as_str(),
                    ts(sub.created_at),
                    ts(sub.updated_at),
                ],
            )
            .map_err(db)?;
        }

        tx.commit().map_err(db)
    }

    fn get_order(&self, id: &str) -> Result<Option<Order>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::query_order(&conn, id)
    }

    fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!(
            "SELECT {} FROM orders {} ORDER BY submitted_at ASC LIMIT ? OFFSET ?",
            ORDER_COLUMNS, where_clause
        );

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        Self::collect(&conn, &sql, &param_refs, Self::row_to_order)
    }

    fn count_orders(&self, filter: &OrderFilter) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM orders {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(db)
    }

    fn update_order_status(
        &self,
        id: &str,
        expected: OrderStatus,
        new: OrderStatus,
        status_info: Option<&str>,
    ) -> Result<Order, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let completed_at = new.is_terminal().then(|| ts(now));

        let updated = conn
            .execute(
                "UPDATE orders SET status = ?, status_info = COALESCE(?, status_info), updated_at = ?, completed_at = COALESCE(?, completed_at) WHERE id = ? AND status = ?",
                params![new.as_str(), status_info, ts(now), completed_at, id, expected.as_str()],
            )
            .map_err(db)?;

        if updated == 0 {
            return Err(Self::cas_miss(&conn, "orders", "order", id, expected.as_str()));
        }

        Self::query_order(&conn, id)?.ok_or_else(|| StoreError::not_found("order", id))
    }

    fn refresh_order_status(&self, id: &str) -> Result<StatusChange, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db)?;

        let order = Self::query_order(&tx, id)?.ok_or_else(|| StoreError::not_found("order", id))?;
        let unchanged = StatusChange {
            previous: order.status,
            current: order.status,
        };
        if order.order_type == OrderType::Subscription || order.status.is_terminal() {
            return Ok(unchanged);
        }

        let statuses = Self::scope_statuses(&tx, &ItemScope::Order(id.to_string()))?;
        let derived = derive_order_status(&statuses, &order.packaging);
        if derived == order.status {
            return Ok(unchanged);
        }

        let now = Utc::now();
        let info = match (&derived, &order.packaging) {
            (OrderStatus::Failed, PackagingState::Failed { reason }) => {
                format!("Packaging failed: {}", reason)
            }
            _ => status_message(derived).to_string(),
        };
        tx.execute(
            "UPDATE orders SET status = ?, status_info = ?, updated_at = ?, completed_at = ? WHERE id = ?",
            params![
                derived.as_str(),
                info,
                ts(now),
                derived.is_terminal().then(|| ts(now)),
                id
            ],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;

        Ok(StatusChange {
            previous: order.status,
            current: derived,
        })
    }

    fn set_packaging(&self, order_id: &str, state: &PackagingState) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE orders SET packaging = ?, updated_at = ? WHERE id = ?",
                params![to_json(state)?, ts(Utc::now()), order_id],
            )
            .map_err(db)?;
        if updated == 0 {
            return Err(StoreError::not_found("order", order_id));
        }
        Ok(())
    }

    fn complete_packaging(&self, order_id: &str, file: &DeliveredFile) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db)?;

        let order = Self::query_order(&tx, order_id)?
            .ok_or_else(|| StoreError::not_found("order", order_id))?;
        if order.packaging != PackagingState::Pending {
            return Err(StoreError::Conflict {
                entity: "order packaging",
                id: order_id.to_string(),
                expected: "pending".to_string(),
                actual: to_json(&order.packaging)?,
            });
        }

        Self::insert_file(&tx, file)?;
        let state = PackagingState::Completed {
            location: file.location.clone(),
        };
        tx.execute(
            "UPDATE orders SET packaging = ?, updated_at = ? WHERE id = ?",
            params![to_json(&state)?, ts(Utc::now()), order_id],
        )
        .map_err(db)?;

        tx.commit().map_err(db)
    }

    fn get_item(&self, id: &str) -> Result<Option<OrderItem>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::query_item(&conn, id)
    }

    fn list_items(&self, order_id: &str) -> Result<Vec<OrderItem>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::collect(
            &conn,
            &format!(
                "SELECT {} FROM order_items WHERE order_id = ? ORDER BY seq",
                ITEM_COLUMNS
            ),
            &[&order_id],
            Self::row_to_item,
        )
    }

    fn list_scope_items(&self, scope: &ItemScope) -> Result<Vec<OrderItem>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let column = match scope {
            ItemScope::Order(_) => "order_id",
            ItemScope::Batch(_) => "batch_id",
        };
        Self::collect(
            &conn,
            &format!(
                "SELECT {} FROM order_items WHERE {} = ? ORDER BY seq",
                ITEM_COLUMNS, column
            ),
            &[&scope.id()],
            Self::row_to_item,
        )
    }

    fn count_unfinished_items(&self, scope: &ItemScope) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let statuses = Self::scope_statuses(&conn, scope)?;
        Ok(statuses.iter().filter(|s| !s.is_terminal()).count() as i64)
    }

    fn update_item_status(
        &self,
        id: &str,
        expected: ItemStatus,
        new: ItemStatus,
        status_info: Option<&str>,
    ) -> Result<OrderItem, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let completed_at = new.is_terminal().then(|| ts(now));

        let updated = conn
            .execute(
                "UPDATE order_items SET status = ?, status_info = COALESCE(?, status_info), updated_at = ?, completed_at = COALESCE(completed_at, ?) WHERE id = ? AND status = ?",
                params![new.as_str(), status_info, ts(now), completed_at, id, expected.as_str()],
            )
            .map_err(db)?;

        if updated == 0 {
            return Err(Self::cas_miss(&conn, "order_items", "order item", id, expected.as_str()));
        }

        Self::query_item(&conn, id)?.ok_or_else(|| StoreError::not_found("order item", id))
    }

    fn begin_item_attempt(&self, id: &str, expected: ItemStatus) -> Result<OrderItem, StoreError> {
        let conn = self.conn.lock().unwrap();

        let updated = conn
            .execute(
                "UPDATE order_items SET status = ?, attempts = attempts + 1, updated_at = ? WHERE id = ? AND status = ?",
                params![
                    ItemStatus::InProduction.as_str(),
                    ts(Utc::now()),
                    id,
                    expected.as_str()
                ],
            )
            .map_err(db)?;

        if updated == 0 {
            return Err(Self::cas_miss(&conn, "order_items", "order item", id, expected.as_str()));
        }

        Self::query_item(&conn, id)?.ok_or_else(|| StoreError::not_found("order item", id))
    }

    fn complete_item(&self, id: &str, file: &DeliveredFile) -> Result<OrderItem, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db)?;
        let now = Utc::now();

        let updated = tx
            .execute(
                "UPDATE order_items SET status = ?, file_id = ?, status_info = NULL, updated_at = ?, completed_at = ? WHERE id = ? AND status = ?",
                params![
                    ItemStatus::Completed.as_str(),
                    file.id,
                    ts(now),
                    ts(now),
                    id,
                    ItemStatus::InProduction.as_str()
                ],
            )
            .map_err(db)?;

        if updated == 0 {
            return Err(Self::cas_miss(
                &tx,
                "order_items",
                "order item",
                id,
                ItemStatus::InProduction.as_str(),
            ));
        }

        Self::insert_file(&tx, file)?;
        let item =
            Self::query_item(&tx, id)?.ok_or_else(|| StoreError::not_found("order item", id))?;
        tx.commit().map_err(db)?;
        Ok(item)
    }

    fn get_subscription(&self, id: &str) -> Result<Option<Subscription>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::query_subscription(&conn, id)
    }

    fn list_order_subscriptions(&self, order_id: &str) -> Result<Vec<Subscription>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::collect(
            &conn,
            &format!(
                "SELECT {} FROM subscriptions WHERE order_id = ? ORDER BY created_at",
                SUBSCRIPTION_COLUMNS
            ),
            &[&order_id],
            Self::row_to_subscription,
        )
    }

    fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::collect(
            &conn,
            &format!(
                "SELECT {} FROM subscriptions WHERE status = ? ORDER BY next_timeslot",
                SUBSCRIPTION_COLUMNS
            ),
            &[&SubscriptionStatus::Active.as_str()],
            Self::row_to_subscription,
        )
    }

    fn update_subscription_status(
        &self,
        id: &str,
        expected: SubscriptionStatus,
        new: SubscriptionStatus,
    ) -> Result<Subscription, StoreError> {
        let conn = self.conn.lock().unwrap();

        let updated = conn
            .execute(
                "UPDATE subscriptions SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
                params![new.as_str(), ts(Utc::now()), id, expected.as_str()],
            )
            .map_err(db)?;

        if updated == 0 {
            return Err(Self::cas_miss(
                &conn,
                "subscriptions",
                "subscription",
                id,
                expected.as_str(),
            ));
        }

        Self::query_subscription(&conn, id)?
            .ok_or_else(|| StoreError::not_found("subscription", id))
    }

    fn advance_subscription(
        &self,
        id: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE subscriptions SET next_timeslot = ?, updated_at = ? WHERE id = ? AND next_timeslot = ?",
                params![ts(next), ts(Utc::now()), id, ts(expected)],
            )
            .map_err(db)?;
        Ok(updated == 1)
    }

    fn create_batch(
        &self,
        subscription_id: &str,
        timeslot: DateTime<Utc>,
    ) -> Result<BatchCreation, StoreError> {
        let conn = self.conn.lock().unwrap();

        let subscription = Self::query_subscription(&conn, subscription_id)?
            .ok_or_else(|| StoreError::not_found("subscription", subscription_id))?;

        let now = ts(Utc::now());
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO batches (id, subscription_id, order_id, timeslot, status, materialized, created_at, updated_at) VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    subscription_id,
                    subscription.order_id,
                    ts(timeslot),
                    OrderStatus::Submitted.as_str(),
                    now,
                    now,
                ],
            )
            .map_err(db)?;

        let batch = conn
            .query_row(
                &format!(
                    "SELECT {} FROM batches WHERE subscription_id = ? AND timeslot = ?",
                    BATCH_COLUMNS
                ),
                params![subscription_id, ts(timeslot)],
                Self::row_to_batch,
            )
            .map_err(db)?;

        if inserted == 1 {
            Ok(BatchCreation::Created(batch))
        } else {
            Ok(BatchCreation::Existing(batch))
        }
    }

    fn get_batch(&self, id: &str) -> Result<Option<Batch>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::query_batch(&conn, id)
    }

    fn list_batches(&self, subscription_id: &str) -> Result<Vec<Batch>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::collect(
            &conn,
            &format!(
                "SELECT {} FROM batches WHERE subscription_id = ? ORDER BY timeslot",
                BATCH_COLUMNS
            ),
            &[&subscription_id],
            Self::row_to_batch,
        )
    }

    fn materialize_batch(&self, batch_id: &str, items: &[OrderItem]) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db)?;

        let batch = Self::query_batch(&tx, batch_id)?
            .ok_or_else(|| StoreError::not_found("batch", batch_id))?;
        if batch.materialized {
            return Ok(false);
        }

        let mut seq = Self::next_seq(&tx, &batch.order_id)?;
        for item in items {
            Self::insert_item(&tx, seq, item)?;
            seq += 1;
        }

        let statuses: Vec<ItemStatus> = items.iter().map(|i| i.status).collect();
        let status = if statuses.is_empty() {
            OrderStatus::Completed
        } else {
            derive_order_status(&statuses, &PackagingState::NotRequested)
        };
        tx.execute(
            "UPDATE batches SET materialized = 1, status = ?, updated_at = ? WHERE id = ?",
            params![status.as_str(), ts(Utc::now()), batch_id],
        )
        .map_err(db)?;

        tx.commit().map_err(db)?;
        Ok(true)
    }

    fn refresh_batch_status(&self, batch_id: &str) -> Result<StatusChange, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db)?;

        let batch = Self::query_batch(&tx, batch_id)?
            .ok_or_else(|| StoreError::not_found("batch", batch_id))?;
        let statuses = Self::scope_statuses(&tx, &ItemScope::Batch(batch_id.to_string()))?;
        let derived = if statuses.is_empty() && batch.materialized {
            OrderStatus::Completed
        } else {
            derive_order_status(&statuses, &PackagingState::NotRequested)
        };

        if derived != batch.status {
            tx.execute(
                "UPDATE batches SET status = ?, updated_at = ? WHERE id = ?",
                params![derived.as_str(), ts(Utc::now()), batch_id],
            )
            .map_err(db)?;
            tx.commit().map_err(db)?;
        }

        Ok(StatusChange {
            previous: batch.status,
            current: derived,
        })
    }

    fn get_file(&self, id: &str) -> Result<Option<DeliveredFile>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::query_file(&conn, id)
    }

    fn list_order_files(&self, order_id: &str) -> Result<Vec<DeliveredFile>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::collect(
            &conn,
            &format!(
                "SELECT {} FROM delivered_files WHERE order_id = ? ORDER BY created_at",
                FILE_COLUMNS
            ),
            &[&order_id],
            Self::row_to_file,
        )
    }

    fn list_expired_files(&self, now: DateTime<Utc>) -> Result<Vec<DeliveredFile>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::collect(
            &conn,
            &format!(
                "SELECT {} FROM delivered_files WHERE available = 1 AND expires_at <= ? ORDER BY expires_at",
                FILE_COLUMNS
            ),
            &[&ts(now)],
            Self::row_to_file,
        )
    }

    fn list_files_expiring_before(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<DeliveredFile>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::collect(
            &conn,
            &format!(
                "SELECT {} FROM delivered_files WHERE available = 1 AND expiry_warned = 0 AND expires_at > ? AND expires_at <= ? ORDER BY expires_at",
                FILE_COLUMNS
            ),
            &[&ts(now), &ts(until)],
            Self::row_to_file,
        )
    }

    fn mark_file_warned(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE delivered_files SET expiry_warned = 1 WHERE id = ? AND expiry_warned = 0",
                params![id],
            )
            .map_err(db)?;
        Ok(updated == 1)
    }

    fn mark_file_unavailable(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE delivered_files SET available = 0 WHERE id = ? AND available = 1",
                params![id],
            )
            .map_err(db)?;
        if updated == 0 && Self::query_file(&conn, id)?.is_none() {
            return Err(StoreError::not_found("delivered file", id));
        }
        Ok(updated == 1)
    }

    fn record_download(&self, id: &str, at: DateTime<Utc>) -> Result<DeliveredFile, StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE delivered_files SET downloads = downloads + 1, last_downloaded_at = ? WHERE id = ? AND available = 1",
                params![ts(at), id],
            )
            .map_err(db)?;

        let file = Self::query_file(&conn, id)?
            .ok_or_else(|| StoreError::not_found("delivered file", id))?;
        if updated == 0 {
            return Err(StoreError::Conflict {
                entity: "delivered file",
                id: id.to_string(),
                expected: "available".to_string(),
                actual: "unavailable".to_string(),
            });
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{DeliveryOptions, Priority};
    use chrono::{Duration, TimeZone};

    fn create_test_store() -> SqliteOrderStore {
        SqliteOrderStore::in_memory().unwrap()
    }

    fn order(id: &str, order_type: OrderType) -> Order {
        let now = Utc::now();
        Order {
            id: id.to_string(),
            order_type,
            status: OrderStatus::Accepted,
            status_info: None,
            ordered_by: "alice".to_string(),
            reference: Some("ref-1".to_string()),
            priority: Priority::Standard,
            delivery: DeliveryOptions::default(),
            options: BTreeMap::new(),
            extensions: BTreeMap::new(),
            packaging: PackagingState::NotRequested,
            submitted_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn item(id: &str, order_id: &str, status: ItemStatus) -> OrderItem {
        let now = Utc::now();
        OrderItem {
            id: id.to_string(),
            order_id: order_id.to_string(),
            batch_id: None,
            item_id: format!("client-{}", id),
            identifier: format!("S2A_{}", id),
            collection: "S2".to_string(),
            options: BTreeMap::from([("format".to_string(), "GeoTIFF".to_string())]),
            status,
            status_info: None,
            attempts: 0,
            file_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn file_for(item: &OrderItem, location: &str) -> DeliveredFile {
        let now = Utc::now();
        DeliveredFile::new(
            &item.order_id,
            Some(item.id.clone()),
            location,
            now,
            now + Duration::days(10),
        )
    }

    fn subscription(id: &str, order_id: &str) -> Subscription {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Subscription {
            id: id.to_string(),
            order_id: order_id.to_string(),
            owner: "alice".to_string(),
            collection: "S2".to_string(),
            options: BTreeMap::new(),
            begin: t0,
            end: t0 + Duration::days(30),
            timeslot_secs: 86400,
            next_timeslot: t0,
            status: SubscriptionStatus::Active,
            created_at: t0,
            updated_at: t0,
        }
    }

    fn seeded_store() -> SqliteOrderStore {
        let store = create_test_store();
        store
            .insert_order(
                &order("o1", OrderType::Product),
                &[
                    item("i1", "o1", ItemStatus::Accepted),
                    item("i2", "o1", ItemStatus::Accepted),
                ],
                None,
            )
            .unwrap();
        store
    }

    #[test]
    fn test_insert_and_get_order() {
        let store = seeded_store();

        let fetched = store.get_order("o1").unwrap().unwrap();
        assert_eq!(fetched.ordered_by, "alice");
        assert_eq!(fetched.reference.as_deref(), Some("ref-1"));
        assert_eq!(fetched.status, OrderStatus::Accepted);

        let items = store.list_items("o1").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "i1");
        assert_eq!(items[0].options.get("format").map(String::as_str), Some("GeoTIFF"));
    }

    #[test]
    fn test_get_nonexistent_order() {
        let store = create_test_store();
        assert!(store.get_order("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_and_count_with_filter() {
        let store = seeded_store();
        store
            .insert_order(&order("o2", OrderType::Massive), &[], None)
            .unwrap();

        let massive = OrderFilter::new().with_order_type(OrderType::Massive);
        assert_eq!(store.list_orders(&massive).unwrap().len(), 1);
        assert_eq!(store.count_orders(&OrderFilter::new()).unwrap(), 2);
        assert_eq!(
            store
                .count_orders(&OrderFilter::new().with_ordered_by("bob"))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_item_compare_and_set() {
        let store = seeded_store();

        let updated = store
            .update_item_status(
                "i1",
                ItemStatus::Accepted,
                ItemStatus::Cancelled,
                Some("by client"),
            )
            .unwrap();
        assert_eq!(updated.status, ItemStatus::Cancelled);
        assert!(updated.completed_at.is_some());

        let err = store
            .update_item_status("i1", ItemStatus::Accepted, ItemStatus::InProduction, None)
            .unwrap_err();
        assert!(err.is_conflict());

        let err = store
            .update_item_status("nope", ItemStatus::Accepted, ItemStatus::Cancelled, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_begin_attempt_counts() {
        let store = seeded_store();

        let item = store.begin_item_attempt("i1", ItemStatus::Accepted).unwrap();
        assert_eq!(item.status, ItemStatus::InProduction);
        assert_eq!(item.attempts, 1);

        let item = store
            .begin_item_attempt("i1", ItemStatus::InProduction)
            .unwrap();
        assert_eq!(item.attempts, 2);
    }

    #[test]
    fn test_complete_item_registers_exactly_one_file() {
        let store = seeded_store();
        let item = store.begin_item_attempt("i1", ItemStatus::Accepted).unwrap();

        let file = file_for(&item, "/deliveries/i1.tif");
        let completed = store.complete_item("i1", &file).unwrap();
        assert_eq!(completed.status, ItemStatus::Completed);
        assert_eq!(completed.file_id.as_deref(), Some(file.id.as_str()));

        // A replayed completion loses the compare-and-set and writes nothing.
        let again = file_for(&item, "/deliveries/i1-again.tif");
        assert!(store.complete_item("i1", &again).unwrap_err().is_conflict());

        let files = store.list_order_files("o1").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].location, "/deliveries/i1.tif");
    }

    #[test]
    fn test_complete_item_rolls_back_on_duplicate_file() {
        let store = seeded_store();
        let item = store.begin_item_attempt("i1", ItemStatus::Accepted).unwrap();

        // Pre-register a file for the item through another path.
        let first = file_for(&item, "/a");
        {
            let conn = store.conn.lock().unwrap();
            SqliteOrderStore::insert_file(&conn, &first).unwrap();
        }

        let second = file_for(&item, "/b");
        let err = store.complete_item("i1", &second).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        let item = store.get_item("i1").unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::InProduction);
    }

    #[test]
    fn test_refresh_order_status_derives_from_items() {
        let store = seeded_store();

        store.begin_item_attempt("i1", ItemStatus::Accepted).unwrap();
        let change = store.refresh_order_status("o1").unwrap();
        assert_eq!(change.previous, OrderStatus::Accepted);
        assert_eq!(change.current, OrderStatus::InProduction);

        let item = store.get_item("i1").unwrap().unwrap();
        store.complete_item("i1", &file_for(&item, "/x")).unwrap();
        store
            .update_item_status("i2", ItemStatus::Accepted, ItemStatus::Cancelled, None)
            .unwrap();

        let change = store.refresh_order_status("o1").unwrap();
        assert_eq!(change.current, OrderStatus::Completed);
        let order = store.get_order("o1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert!(order.completed_at.is_some());

        // Terminal orders are not re-derived.
        assert!(!store.refresh_order_status("o1").unwrap().changed());
    }

    #[test]
    fn test_packaging_completion_is_single_shot() {
        let store = seeded_store();
        store.set_packaging("o1", &PackagingState::Pending).unwrap();

        let now = Utc::now();
        let package = DeliveredFile::new("o1", None, "/pkg/o1", now, now + Duration::days(1));
        store.complete_packaging("o1", &package).unwrap();

        let order = store.get_order("o1").unwrap().unwrap();
        assert_eq!(
            order.packaging,
            PackagingState::Completed {
                location: "/pkg/o1".to_string()
            }
        );

        let other = DeliveredFile::new("o1", None, "/pkg/o1b", now, now + Duration::days(1));
        assert!(store.complete_packaging("o1", &other).unwrap_err().is_conflict());
    }

    #[test]
    fn test_create_batch_is_idempotent() {
        let store = create_test_store();
        let sub = subscription("s1", "o1");
        store
            .insert_order(&order("o1", OrderType::Subscription), &[], Some(&sub))
            .unwrap();

        let first = store.create_batch("s1", sub.begin).unwrap();
        let second = store.create_batch("s1", sub.begin).unwrap();

        assert!(matches!(first, BatchCreation::Created(_)));
        assert!(matches!(second, BatchCreation::Existing(_)));
        assert_eq!(first.batch().id, second.batch().id);
        assert_eq!(store.list_batches("s1").unwrap().len(), 1);

        store
            .create_batch("s1", sub.begin + Duration::days(1))
            .unwrap();
        assert_eq!(store.list_batches("s1").unwrap().len(), 2);
    }

    #[test]
    fn test_materialize_batch_once() {
        let store = create_test_store();
        let sub = subscription("s1", "o1");
        store
            .insert_order(&order("o1", OrderType::Subscription), &[], Some(&sub))
            .unwrap();
        let batch = store.create_batch("s1", sub.begin).unwrap().batch().clone();

        let mut first = item("b1", "o1", ItemStatus::Accepted);
        first.batch_id = Some(batch.id.clone());
        assert!(store.materialize_batch(&batch.id, &[first]).unwrap());

        let mut dup = item("b1-dup", "o1", ItemStatus::Accepted);
        dup.batch_id = Some(batch.id.clone());
        assert!(!store.materialize_batch(&batch.id, &[dup]).unwrap());

        let items = store
            .list_scope_items(&ItemScope::Batch(batch.id.clone()))
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(store.get_batch(&batch.id).unwrap().unwrap().status, OrderStatus::Accepted);
    }

    #[test]
    fn test_empty_batch_completes() {
        let store = create_test_store();
        let sub = subscription("s1", "o1");
        store
            .insert_order(&order("o1", OrderType::Subscription), &[], Some(&sub))
            .unwrap();
        let batch = store.create_batch("s1", sub.begin).unwrap().batch().clone();

        store.materialize_batch(&batch.id, &[]).unwrap();
        let batch = store.get_batch(&batch.id).unwrap().unwrap();
        assert!(batch.materialized);
        assert_eq!(batch.status, OrderStatus::Completed);
    }

    #[test]
    fn test_advance_subscription_compare_and_set() {
        let store = create_test_store();
        let sub = subscription("s1", "o1");
        store
            .insert_order(&order("o1", OrderType::Subscription), &[], Some(&sub))
            .unwrap();

        let next = sub.begin + Duration::days(1);
        assert!(store.advance_subscription("s1", sub.begin, next).unwrap());
        assert!(!store.advance_subscription("s1", sub.begin, next).unwrap());
        assert_eq!(
            store.get_subscription("s1").unwrap().unwrap().next_timeslot,
            next
        );
    }

    #[test]
    fn test_expired_files_and_unavailable_cas() {
        let store = seeded_store();
        let item = store.begin_item_attempt("i1", ItemStatus::Accepted).unwrap();
        let now = Utc::now();
        let mut file = file_for(&item, "/x");
        file.created_at = now - Duration::days(11);
        file.expires_at = now - Duration::days(1);
        store.complete_item("i1", &file).unwrap();

        let expired = store.list_expired_files(now).unwrap();
        assert_eq!(expired.len(), 1);

        assert!(store.mark_file_unavailable(&file.id).unwrap());
        assert!(!store.mark_file_unavailable(&file.id).unwrap());
        assert!(store.list_expired_files(now).unwrap().is_empty());
    }

    #[test]
    fn test_expiry_warning_flag() {
        let store = seeded_store();
        let item = store.begin_item_attempt("i1", ItemStatus::Accepted).unwrap();
        let now = Utc::now();
        let mut file = file_for(&item, "/x");
        file.expires_at = now + Duration::hours(5);
        store.complete_item("i1", &file).unwrap();

        let soon = store
            .list_files_expiring_before(now, now + Duration::hours(24))
            .unwrap();
        assert_eq!(soon.len(), 1);
        assert!(store.mark_file_warned(&file.id).unwrap());
        assert!(!store.mark_file_warned(&file.id).unwrap());
        assert!(store
            .list_files_expiring_before(now, now + Duration::hours(24))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_record_download() {
        let store = seeded_store();
        let item = store.begin_item_attempt("i1", ItemStatus::Accepted).unwrap();
        let file = file_for(&item, "/x");
        store.complete_item("i1", &file).unwrap();

        let at = Utc::now();
        let updated = store.record_download(&file.id, at).unwrap();
        assert_eq!(updated.downloads, 1);
        assert!(updated.last_downloaded_at.is_some());

        store.mark_file_unavailable(&file.id).unwrap();
        assert!(store.record_download(&file.id, at).unwrap_err().is_conflict());
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("orders.db");
        {
            let store = SqliteOrderStore::new(&path).unwrap();
            store
                .insert_order(&order("o1", OrderType::Product), &[], None)
                .unwrap();
        }
        let store = SqliteOrderStore::new(&path).unwrap();
        assert!(store.get_order("o1").unwrap().is_some());
    }
}

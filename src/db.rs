//! Order & User Repository
//! Mission: Persist accounts, TWAP parents and executions in SQLite
//!
//! Every call opens and closes its own connection, so concurrent engine
//! tasks and HTTP handlers never share connection state. Decimal columns
//! are stored as TEXT to keep fixed-precision values exact.

use crate::errors::StoreError;
use crate::models::Side;
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub created_at: String,
}

/// Relational form of a TWAP parent order.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub exchanges: Vec<String>,
    pub side: Side,
    pub limit_price: Decimal,
    pub quantity: Decimal,
    pub duration: i64,
    pub status: String,
    pub created_at: String,
    pub percent_exec: Decimal,
    pub avg_exec_price: Decimal,
    pub lots_count: i64,
    pub total_exec: Decimal,
}

/// One immutable fill row.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: i64,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub exchange: String,
    pub timestamp: String,
}

/// Idempotent overwrite of a parent order's running aggregates.
#[derive(Debug, Clone)]
pub struct OrderStateUpdate {
    pub status: String,
    pub percent_exec: Decimal,
    pub avg_exec_price: Decimal,
    pub lots_count: i64,
    pub total_exec: Decimal,
}

pub struct Database {
    db_path: String,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let db = Self {
            db_path: db_path.to_string(),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS twap_orders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                side TEXT NOT NULL,
                limit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                duration INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                percent_exec TEXT NOT NULL DEFAULT '0',
                avg_exec_price TEXT NOT NULL DEFAULT '0',
                lots_count INTEGER NOT NULL DEFAULT 0,
                total_exec TEXT NOT NULL DEFAULT '0'
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS twap_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL REFERENCES twap_orders(id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                exchange TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
            [],
        )?;

        self.seed_default_admin(&conn)?;
        Ok(())
    }

    /// First boot gets a usable admin account.
    fn seed_default_admin(&self, conn: &Connection) -> Result<(), StoreError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE role = 'admin'",
            [],
            |row| row.get(0),
        )?;
        if count > 0 {
            return Ok(());
        }

        let password_hash = hash("admin123", DEFAULT_COST)?;
        conn.execute(
            "INSERT INTO users (id, username, password_hash, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                "admin",
                password_hash,
                Role::Admin.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        info!("🔐 Default admin user created (username: admin, password: admin123)");
        warn!("⚠️  CHANGE DEFAULT PASSWORD IN PRODUCTION!");
        Ok(())
    }

    // ---- users -----------------------------------------------------------

    pub fn create_user(
        &self,
        username: &str,
        password: &str,
        role: Role,
    ) -> Result<UserRecord, StoreError> {
        let user = UserRecord {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: hash(password, DEFAULT_COST)?,
            role,
            created_at: Utc::now().to_rfc3339(),
        };

        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO users (id, username, password_hash, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id,
                user.username,
                user.password_hash,
                user.role.as_str(),
                user.created_at,
            ],
        );
        match result {
            Ok(_) => {
                info!(username = %user.username, "✅ Created user");
                Ok(user)
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, username, password_hash, role, created_at
             FROM users WHERE username = ?1",
        )?;

        let result = stmt.query_row(params![username], |row| {
            let role_str: String = row.get(3)?;
            Ok(UserRecord {
                id: row.get(0)?,
                username: row.get(1)?,
                password_hash: row.get(2)?,
                role: Role::from_str(&role_str).unwrap_or(Role::User),
                created_at: row.get(4)?,
            })
        });

        match result {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Check credentials; `None` for unknown user or wrong password.
    pub fn verify_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let Some(user) = self.get_user_by_username(username)? else {
            return Ok(None);
        };
        if verify(password, &user.password_hash)? {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, username, password_hash, role, created_at FROM users")?;

        let users = stmt
            .query_map([], |row| {
                let role_str: String = row.get(3)?;
                Ok(UserRecord {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    password_hash: row.get(2)?,
                    role: Role::from_str(&role_str).unwrap_or(Role::User),
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(users)
    }

    pub fn delete_user(&self, username: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let affected = conn.execute("DELETE FROM users WHERE username = ?1", params![username])?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        info!(username, "🗑️  Deleted user");
        Ok(())
    }

    // ---- twap orders -----------------------------------------------------

    pub fn add_parent_order(&self, order: &OrderRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO twap_orders
                (id, user_id, symbol, exchange, side, limit_price, quantity,
                 duration, status, created_at, percent_exec, avg_exec_price,
                 lots_count, total_exec)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                order.order_id,
                order.user_id,
                order.symbol,
                order.exchanges.join(","),
                order.side.as_str(),
                order.limit_price.to_string(),
                order.quantity.to_string(),
                order.duration,
                order.status,
                order.created_at,
                order.percent_exec.to_string(),
                order.avg_exec_price.to_string(),
                order.lots_count,
                order.total_exec.to_string(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    pub fn append_execution(
        &self,
        order_id: &str,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        exchange: &str,
        timestamp: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO twap_executions
                (order_id, symbol, side, quantity, price, exchange, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                order_id,
                symbol,
                side.as_str(),
                quantity.to_string(),
                price.to_string(),
                exchange,
                timestamp,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_parent_state(
        &self,
        order_id: &str,
        state: &OrderStateUpdate,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE twap_orders
             SET status = ?2, percent_exec = ?3, avg_exec_price = ?4,
                 lots_count = ?5, total_exec = ?6
             WHERE id = ?1",
            params![
                order_id,
                state.status,
                state.percent_exec.to_string(),
                state.avg_exec_price.to_string(),
                state.lots_count,
                state.total_exec.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Orders owned by `user_id`, optionally narrowed to one id. An empty
    /// result (including a foreign order id) is `NotFound`.
    pub fn get_orders(
        &self,
        user_id: &str,
        order_id: Option<&str>,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT id, user_id, symbol, exchange, side, limit_price, quantity,
                    duration, status, created_at, percent_exec, avg_exec_price,
                    lots_count, total_exec
             FROM twap_orders WHERE user_id = ?1",
        );
        if order_id.is_some() {
            sql.push_str(" AND id = ?2");
        }
        sql.push_str(" ORDER BY created_at");

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<OrderRecord> {
            let exchanges: String = row.get(3)?;
            let side: String = row.get(4)?;
            Ok(OrderRecord {
                order_id: row.get(0)?,
                user_id: row.get(1)?,
                symbol: row.get(2)?,
                exchanges: exchanges.split(',').map(str::to_string).collect(),
                side: Side::from_str(&side).unwrap_or(Side::Buy),
                limit_price: decimal_column(row, 5)?,
                quantity: decimal_column(row, 6)?,
                duration: row.get(7)?,
                status: row.get(8)?,
                created_at: row.get(9)?,
                percent_exec: decimal_column(row, 10)?,
                avg_exec_price: decimal_column(row, 11)?,
                lots_count: row.get(12)?,
                total_exec: decimal_column(row, 13)?,
            })
        };

        let orders = match order_id {
            Some(id) => stmt.query_map(params![user_id, id], map_row)?,
            None => stmt.query_map(params![user_id], map_row)?,
        }
        .collect::<Result<Vec<_>, _>>()?;

        if orders.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(orders)
    }

    /// Executions of one order, gated on ownership first so foreign orders
    /// read as missing.
    pub fn get_executions(
        &self,
        user_id: &str,
        order_id: &str,
        symbol: Option<&str>,
        side: Option<Side>,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let conn = self.conn()?;

        let owned: i64 = conn.query_row(
            "SELECT COUNT(*) FROM twap_orders WHERE id = ?1 AND user_id = ?2",
            params![order_id, user_id],
            |row| row.get(0),
        )?;
        if owned == 0 {
            return Err(StoreError::NotFound);
        }

        let mut sql = String::from(
            "SELECT id, order_id, symbol, side, quantity, price, exchange, timestamp
             FROM twap_executions WHERE order_id = ?1",
        );
        let mut args: Vec<String> = vec![order_id.to_string()];
        if let Some(symbol) = symbol {
            args.push(symbol.to_string());
            sql.push_str(&format!(" AND symbol = ?{}", args.len()));
        }
        if let Some(side) = side {
            args.push(side.as_str().to_string());
            sql.push_str(&format!(" AND side = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                let side: String = row.get(3)?;
                Ok(ExecutionRecord {
                    id: row.get(0)?,
                    order_id: row.get(1)?,
                    symbol: row.get(2)?,
                    side: Side::from_str(&side).unwrap_or(Side::Buy),
                    quantity: decimal_column(row, 4)?,
                    price: decimal_column(row, 5)?,
                    exchange: row.get(6)?,
                    timestamp: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if executions.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(executions)
    }
}

fn decimal_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Ok(Decimal::from_str(&raw).unwrap_or_default())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::NamedTempFile;

    fn test_db() -> (Database, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let db = Database::new(temp.path().to_str().unwrap()).unwrap();
        (db, temp)
    }

    fn sample_order(db: &Database, order_id: &str, username: &str) -> OrderRecord {
        let user = db.create_user(username, "pass", Role::User).unwrap();
        let order = OrderRecord {
            order_id: order_id.to_string(),
            user_id: user.id,
            symbol: "BTCUSDT".to_string(),
            exchanges: vec!["Binance".to_string(), "Coinbase".to_string()],
            side: Side::Buy,
            limit_price: dec!(100000),
            quantity: dec!(0.5),
            duration: 5,
            status: "pending".to_string(),
            created_at: Utc::now().to_rfc3339(),
            percent_exec: dec!(0),
            avg_exec_price: dec!(0),
            lots_count: 0,
            total_exec: dec!(0),
        };
        db.add_parent_order(&order).unwrap();
        order
    }

    #[test]
    fn test_default_admin_seeded() {
        let (db, _temp) = test_db();
        let admin = db.get_user_by_username("admin").unwrap().unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert!(db.verify_password("admin", "admin123").unwrap().is_some());
        assert!(db.verify_password("admin", "nope").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let (db, _temp) = test_db();
        db.create_user("alice", "pw", Role::User).unwrap();
        let err = db.create_user("alice", "pw2", Role::User).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate));
    }

    #[test]
    fn test_delete_user() {
        let (db, _temp) = test_db();
        db.create_user("bob", "pw", Role::User).unwrap();
        db.delete_user("bob").unwrap();
        assert!(db.get_user_by_username("bob").unwrap().is_none());
        assert!(matches!(db.delete_user("bob"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_order_round_trip() {
        let (db, _temp) = test_db();
        let order = sample_order(&db, "order-1", "carol");

        let fetched = db.get_orders(&order.user_id, Some("order-1")).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].symbol, "BTCUSDT");
        assert_eq!(fetched[0].exchanges, vec!["Binance", "Coinbase"]);
        assert_eq!(fetched[0].limit_price, dec!(100000));
        assert_eq!(fetched[0].status, "pending");

        // Duplicate order id collides.
        let err = db.add_parent_order(&order).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate));
    }

    #[test]
    fn test_update_parent_state_is_idempotent() {
        let (db, _temp) = test_db();
        let order = sample_order(&db, "order-2", "dave");

        let state = OrderStateUpdate {
            status: "completed".to_string(),
            percent_exec: dec!(100),
            avg_exec_price: dec!(99123.45),
            lots_count: 7,
            total_exec: dec!(0.5),
        };
        db.update_parent_state("order-2", &state).unwrap();
        db.update_parent_state("order-2", &state).unwrap();

        let fetched = db.get_orders(&order.user_id, Some("order-2")).unwrap();
        assert_eq!(fetched[0].status, "completed");
        assert_eq!(fetched[0].percent_exec, dec!(100));
        assert_eq!(fetched[0].avg_exec_price, dec!(99123.45));
        assert_eq!(fetched[0].lots_count, 7);
    }

    #[test]
    fn test_executions_round_trip_and_filters() {
        let (db, _temp) = test_db();
        let order = sample_order(&db, "order-3", "erin");

        db.append_execution(
            "order-3",
            "BTCUSDT",
            Side::Buy,
            dec!(0.1),
            dec!(99000),
            "Binance",
            "2025-02-01T00:00:01+00:00",
        )
        .unwrap();
        db.append_execution(
            "order-3",
            "BTCUSDT",
            Side::Buy,
            dec!(0.2),
            dec!(99100),
            "Coinbase",
            "2025-02-01T00:00:02+00:00",
        )
        .unwrap();

        let all = db
            .get_executions(&order.user_id, "order-3", None, None)
            .unwrap();
        assert_eq!(all.len(), 2);
        // Appended in walk order.
        assert_eq!(all[0].exchange, "Binance");
        assert_eq!(all[1].exchange, "Coinbase");

        let sells = db.get_executions(&order.user_id, "order-3", None, Some(Side::Sell));
        assert!(matches!(sells, Err(StoreError::NotFound)));
    }

    #[test]
    fn test_foreign_order_reads_as_missing() {
        let (db, _temp) = test_db();
        let order = sample_order(&db, "order-4", "frank");
        let outsider = db.create_user("grace", "pw", Role::User).unwrap();

        let err = db.get_orders(&outsider.id, Some("order-4")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));

        let err = db
            .get_executions(&outsider.id, "order-4", None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));

        // The owner still sees it.
        assert!(db.get_orders(&order.user_id, Some("order-4")).is_ok());
    }
}

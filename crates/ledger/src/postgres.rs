use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    ArtifactId, DeliveryDetails, DepositRequest, EntryId, LedgerEntry, LedgerError, Money,
    OwnerId, PurchaseId, PurchaseRecord, PurchaseStatus, ReferenceId, Reservation,
    ReservationRequest, ResourceId, Result, WalletAccount, store::LedgerStore,
};

const PURCHASE_COLUMNS: &str = "id, owner_id, resource_id, variant, price_cents, reference_id, \
     status, artifact_id, delivery, created_at, updated_at";

/// SQLSTATE raised when `balance_cents` would leave the BIGINT range.
const NUMERIC_OUT_OF_RANGE: &str = "22003";

const ENTRY_COLUMNS: &str =
    "id, owner_id, amount_cents, category, description, reference_id, purchase_id, status, created_at";

/// PostgreSQL-backed ledger store.
///
/// Every mutating operation runs in one transaction. Operations on the same
/// owner serialize on the wallet row lock (`SELECT … FOR UPDATE`); operations
/// on different owners touch disjoint rows.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    /// Creates a new PostgreSQL ledger store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Maps the reference uniqueness and BIGINT range violations onto the
    /// errors the in-memory store reports for the same conditions.
    fn map_write_error(
        err: sqlx::Error,
        reference_id: &ReferenceId,
        amount: Money,
    ) -> LedgerError {
        if let sqlx::Error::Database(ref db_err) = err {
            if matches!(
                db_err.constraint(),
                Some("unique_purchase_reference" | "unique_entry_reference")
            ) {
                return LedgerError::DuplicateReference(reference_id.clone());
            }
            if db_err.code().as_deref() == Some(NUMERIC_OUT_OF_RANGE) {
                return LedgerError::InvalidAmount(amount);
            }
        }
        LedgerError::Database(err)
    }

    fn row_to_purchase(row: PgRow) -> Result<PurchaseRecord> {
        let status: String = row.try_get("status")?;
        let delivery: Option<serde_json::Value> = row.try_get("delivery")?;
        let delivery = delivery
            .map(serde_json::from_value::<DeliveryDetails>)
            .transpose()?;

        Ok(PurchaseRecord {
            id: PurchaseId::from_uuid(row.try_get::<Uuid, _>("id")?),
            owner_id: OwnerId::from_uuid(row.try_get::<Uuid, _>("owner_id")?),
            resource_id: ResourceId::new(row.try_get::<String, _>("resource_id")?),
            variant: row.try_get("variant")?,
            price: Money::from_cents(row.try_get("price_cents")?),
            reference_id: ReferenceId::new(row.try_get::<String, _>("reference_id")?),
            status: status.parse()?,
            artifact_id: row
                .try_get::<Option<String>, _>("artifact_id")?
                .map(ArtifactId::new),
            delivery,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_entry(row: PgRow) -> Result<LedgerEntry> {
        let category: String = row.try_get("category")?;
        let status: String = row.try_get("status")?;

        Ok(LedgerEntry {
            id: EntryId::from_uuid(row.try_get::<Uuid, _>("id")?),
            owner_id: OwnerId::from_uuid(row.try_get::<Uuid, _>("owner_id")?),
            amount: Money::from_cents(row.try_get("amount_cents")?),
            category: category.parse()?,
            description: row.try_get("description")?,
            reference_id: ReferenceId::new(row.try_get::<String, _>("reference_id")?),
            purchase_id: row
                .try_get::<Option<Uuid>, _>("purchase_id")?
                .map(PurchaseId::from_uuid),
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Creates the wallet row if missing and locks it for the rest of `tx`.
    /// Returns the locked balance.
    async fn lock_wallet(tx: &mut Transaction<'_, Postgres>, owner_id: OwnerId) -> Result<Money> {
        sqlx::query(
            "INSERT INTO wallet_accounts (owner_id) VALUES ($1) ON CONFLICT (owner_id) DO NOTHING",
        )
        .bind(owner_id.as_uuid())
        .execute(&mut **tx)
        .await?;

        let balance: i64 = sqlx::query_scalar(
            "SELECT balance_cents FROM wallet_accounts WHERE owner_id = $1 FOR UPDATE",
        )
        .bind(owner_id.as_uuid())
        .fetch_one(&mut **tx)
        .await?;

        Ok(Money::from_cents(balance))
    }

    async fn lock_purchase(
        tx: &mut Transaction<'_, Postgres>,
        purchase_id: PurchaseId,
    ) -> Result<PurchaseRecord> {
        let row = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE id = $1 FOR UPDATE"
        ))
        .bind(purchase_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(LedgerError::PurchaseNotFound(purchase_id))?;

        Self::row_to_purchase(row)
    }

    async fn insert_entry(tx: &mut Transaction<'_, Postgres>, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (id, owner_id, amount_cents, category, description, reference_id, purchase_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.owner_id.as_uuid())
        .bind(entry.amount.cents())
        .bind(entry.category.as_str())
        .bind(&entry.description)
        .bind(entry.reference_id.as_str())
        .bind(entry.purchase_id.map(|id| id.as_uuid()))
        .bind(entry.status.as_str())
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| Self::map_write_error(e, &entry.reference_id, entry.amount))?;

        Ok(())
    }

    async fn apply_to_balance(
        tx: &mut Transaction<'_, Postgres>,
        entry: &LedgerEntry,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE wallet_accounts SET balance_cents = balance_cents + $2, updated_at = NOW() WHERE owner_id = $1",
        )
        .bind(entry.owner_id.as_uuid())
        .bind(entry.amount.cents())
        .execute(&mut **tx)
        .await
        .map_err(|e| Self::map_write_error(e, &entry.reference_id, entry.amount))?;

        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[tracing::instrument(skip(self, request), fields(owner_id = %request.owner_id, resource_id = %request.resource_id))]
    async fn reserve_funds(&self, request: ReservationRequest) -> Result<Reservation> {
        if !request.amount.is_positive() {
            return Err(LedgerError::InvalidAmount(request.amount));
        }

        let owner_id = request.owner_id;
        let mut tx = self.pool.begin().await?;

        // Serializes every reservation of this owner until commit
        let available = Self::lock_wallet(&mut tx, owner_id).await?;

        let existing = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases \
             WHERE owner_id = $1 AND resource_id = $2 AND status IN ('processing', 'completed') \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(owner_id.as_uuid())
        .bind(request.resource_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let record = Self::row_to_purchase(row)?;
            return match record.status {
                PurchaseStatus::Completed => Ok(Reservation::AlreadyCompleted(record)),
                _ => Err(LedgerError::DuplicateInFlight {
                    owner_id,
                    resource_id: request.resource_id,
                    purchase_id: Some(record.id),
                }),
            };
        }

        // Conditional decrement: the row is only touched if it covers the amount
        let debited: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE wallet_accounts
            SET balance_cents = balance_cents - $2, updated_at = NOW()
            WHERE owner_id = $1 AND balance_cents >= $2
            RETURNING balance_cents
            "#,
        )
        .bind(owner_id.as_uuid())
        .bind(request.amount.cents())
        .fetch_optional(&mut *tx)
        .await?;

        if debited.is_none() {
            return Err(LedgerError::InsufficientFunds {
                owner_id,
                requested: request.amount,
                available,
            });
        }

        let record = PurchaseRecord::processing(&request);
        let delivery = record
            .delivery
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO purchases (id, owner_id, resource_id, variant, price_cents, reference_id, status, artifact_id, delivery, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, $8, $9, $10)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(owner_id.as_uuid())
        .bind(record.resource_id.as_str())
        .bind(&record.variant)
        .bind(record.price.cents())
        .bind(record.reference_id.as_str())
        .bind(record.status.as_str())
        .bind(delivery)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            // Backstop for the duplicate guard
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_active_purchase")
            {
                return LedgerError::DuplicateInFlight {
                    owner_id,
                    resource_id: record.resource_id.clone(),
                    purchase_id: None,
                };
            }
            Self::map_write_error(e, &record.reference_id, record.price)
        })?;

        let entry = LedgerEntry::purchase_debit(&record, request.description.as_str());
        Self::insert_entry(&mut tx, &entry).await?;

        tx.commit().await?;
        Ok(Reservation::Reserved(record))
    }

    #[tracing::instrument(skip(self))]
    async fn finalize_purchase(
        &self,
        purchase_id: PurchaseId,
        artifact_id: &ArtifactId,
    ) -> Result<PurchaseRecord> {
        let mut tx = self.pool.begin().await?;
        let record = Self::lock_purchase(&mut tx, purchase_id).await?;

        if record.status == PurchaseStatus::Completed {
            return match record.artifact_id.clone() {
                Some(existing) if &existing == artifact_id => Ok(record),
                Some(existing) => Err(LedgerError::ArtifactConflict {
                    purchase_id,
                    existing,
                    attempted: artifact_id.clone(),
                }),
                None => Err(LedgerError::Decode(format!(
                    "completed purchase {purchase_id} has no artifact"
                ))),
            };
        }
        record
            .status
            .ensure_transition(purchase_id, PurchaseStatus::Completed)?;

        let row = sqlx::query(&format!(
            "UPDATE purchases SET status = 'completed', artifact_id = $2, updated_at = NOW() \
             WHERE id = $1 RETURNING {PURCHASE_COLUMNS}"
        ))
        .bind(purchase_id.as_uuid())
        .bind(artifact_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let updated = Self::row_to_purchase(row)?;
        tx.commit().await?;
        Ok(updated)
    }

    #[tracing::instrument(skip(self))]
    async fn compensate_failure(&self, purchase_id: PurchaseId) -> Result<PurchaseRecord> {
        let mut tx = self.pool.begin().await?;
        let record = Self::lock_purchase(&mut tx, purchase_id).await?;

        // Already settled either way
        if !record.status.can_transition_to(PurchaseStatus::Failed) {
            return Ok(record);
        }

        let row = sqlx::query(&format!(
            "UPDATE purchases SET status = 'failed', updated_at = NOW() \
             WHERE id = $1 RETURNING {PURCHASE_COLUMNS}"
        ))
        .bind(purchase_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        let failed = Self::row_to_purchase(row)?;

        let refund = LedgerEntry::refund_for(&failed);
        Self::insert_entry(&mut tx, &refund).await?;
        Self::apply_to_balance(&mut tx, &refund).await?;

        tx.commit().await?;
        Ok(failed)
    }

    #[tracing::instrument(skip(self, request), fields(owner_id = %request.owner_id))]
    async fn deposit(&self, request: DepositRequest) -> Result<LedgerEntry> {
        if !request.amount.is_positive() {
            return Err(LedgerError::InvalidAmount(request.amount));
        }

        let mut tx = self.pool.begin().await?;
        Self::lock_wallet(&mut tx, request.owner_id).await?;

        let existing = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE owner_id = $1 AND reference_id = $2 AND category = 'deposit'"
        ))
        .bind(request.owner_id.as_uuid())
        .bind(request.reference_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            tx.commit().await?;
            return Self::row_to_entry(row);
        }

        let entry = LedgerEntry::deposit(&request);
        Self::insert_entry(&mut tx, &entry).await?;
        Self::apply_to_balance(&mut tx, &entry).await?;

        tx.commit().await?;
        Ok(entry)
    }

    async fn get_account(&self, owner_id: OwnerId) -> Result<Option<WalletAccount>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT owner_id, balance_cents, created_at, updated_at
            FROM wallet_accounts
            WHERE owner_id = $1
            "#,
        )
        .bind(owner_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(WalletAccount {
                owner_id: OwnerId::from_uuid(row.try_get::<Uuid, _>("owner_id")?),
                balance: Money::from_cents(row.try_get("balance_cents")?),
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
                updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn get_purchase(&self, purchase_id: PurchaseId) -> Result<Option<PurchaseRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE id = $1"
        ))
        .bind(purchase_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_purchase).transpose()
    }

    async fn find_purchase(
        &self,
        owner_id: OwnerId,
        resource_id: &ResourceId,
    ) -> Result<Option<PurchaseRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases \
             WHERE owner_id = $1 AND resource_id = $2 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(owner_id.as_uuid())
        .bind(resource_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_purchase).transpose()
    }

    async fn entries_for_owner(&self, owner_id: OwnerId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE owner_id = $1 ORDER BY seq ASC"
        ))
        .bind(owner_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn processing_purchases_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PurchaseRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases \
             WHERE status = 'processing' AND created_at < $1 \
             ORDER BY created_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_purchase).collect()
    }
}

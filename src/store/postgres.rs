//! PostgreSQL Store
//!
//! Products live in relational columns because stock is adjusted in place.
//! Carts and orders are stored as JSONB documents next to the columns used for
//! lookups, with a `revision` column guarding every replace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{query, query_as, query_scalar, FromRow, PgPool, Postgres, Row};
use uuid::Uuid;

use crate::domain::aggregates::{Cart, Order, Product};
use crate::domain::value_objects::{Money, OrderId, OrderNumber, ProductId, UserId};
use crate::store::{CartStore, CatalogStore, OrderStore, Page, ProductFilter, StockLevel};
use crate::{MarketplaceError, Result};

const GET_PRODUCT_SQL: &str = "SELECT id, vendor_id, name, images, price, discount_percent, stock, \
     track_quantity, allow_backorder, status, purchases, updated_at FROM products WHERE id = $1";

const FIND_PRODUCTS_SQL: &str = "SELECT id, vendor_id, name, images, price, discount_percent, stock, \
     track_quantity, allow_backorder, status, purchases, updated_at FROM products \
     WHERE ($1::uuid[] IS NULL OR id = ANY($1)) \
       AND ($2::uuid IS NULL OR vendor_id = $2) \
       AND ($3::text IS NULL OR status = $3) \
     ORDER BY id LIMIT $4 OFFSET $5";

const INSERT_PRODUCT_SQL: &str = "INSERT INTO products \
     (id, vendor_id, name, images, price, discount_percent, stock, track_quantity, allow_backorder, status, purchases, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)";

const ADJUST_STOCK_SQL: &str = "UPDATE products SET stock = stock + $2, updated_at = NOW() \
     WHERE id = $1 AND track_quantity AND ($2 >= 0 OR allow_backorder OR stock + $2 >= 0) \
     RETURNING stock";

const STOCK_STATE_SQL: &str = "SELECT stock, track_quantity FROM products WHERE id = $1";

const ADJUST_PURCHASES_SQL: &str = "UPDATE products SET purchases = GREATEST(purchases + $2, 0) WHERE id = $1";

const LOAD_CART_SQL: &str = "SELECT document FROM carts WHERE owner_id = $1";

const INSERT_CART_SQL: &str = "INSERT INTO carts (owner_id, id, document, revision, expires_at) \
     VALUES ($1, $2, $3, $4, $5) ON CONFLICT (owner_id) DO NOTHING";

const UPDATE_CART_SQL: &str = "UPDATE carts SET document = $2, revision = $3, expires_at = $4 \
     WHERE owner_id = $1 AND revision = $5";

const DELETE_EXPIRED_CARTS_SQL: &str = "DELETE FROM carts WHERE expires_at <= $1";

const NEXT_ORDER_SEQUENCE_SQL: &str = "SELECT nextval('order_number_seq')";

const INSERT_ORDER_SQL: &str = "INSERT INTO orders \
     (id, order_number, user_id, vendor_ids, status, needs_reconciliation, document, revision, created_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

const UPDATE_ORDER_SQL: &str = "UPDATE orders SET status = $2, needs_reconciliation = $3, document = $4, revision = $5 \
     WHERE id = $1 AND revision = $6";

const GET_ORDER_SQL: &str = "SELECT document FROM orders WHERE id = $1";

const FIND_BY_ORDER_NUMBER_SQL: &str = "SELECT document FROM orders WHERE order_number = $1";

const ORDERS_FOR_USER_SQL: &str = "SELECT document FROM orders WHERE user_id = $1 \
     ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3";

const ORDERS_FOR_VENDOR_SQL: &str = "SELECT document FROM orders WHERE $1 = ANY(vendor_ids) \
     ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3";

const ORDERS_NEEDING_RECONCILIATION_SQL: &str = "SELECT document FROM orders WHERE needs_reconciliation \
     ORDER BY created_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub fn pool(&self) -> &PgPool { &self.pool }

    /// Lists a product. The catalog is owned elsewhere; this is how it gets seeded.
    pub async fn insert_product(&self, product: &Product) -> Result<()> {
        query(INSERT_PRODUCT_SQL)
            .bind(product.id.into_uuid())
            .bind(product.vendor.into_uuid())
            .bind(&product.name)
            .bind(&product.images)
            .bind(product.price.amount())
            .bind(product.discount_percent)
            .bind(product.stock)
            .bind(product.track_quantity)
            .bind(product.allow_backorder)
            .bind(product.status.as_str())
            .bind(product.purchases)
            .bind(product.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_orders(&self, sql: &'static str, owner: UserId, page: Page) -> Result<Vec<Order>> {
        let rows: Vec<Json<Order>> = query_scalar(sql)
            .bind(owner.into_uuid())
            .bind(to_i64(page.limit())?)
            .bind(to_i64(page.offset())?)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|Json(order)| order).collect())
    }
}

impl<'r> FromRow<'r, PgRow> for Product {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: ProductId::from_uuid(row.try_get("id")?),
            vendor: UserId::from_uuid(row.try_get("vendor_id")?),
            name: row.try_get("name")?,
            images: row.try_get("images")?,
            price: Money::new(row.try_get("price")?),
            discount_percent: row.try_get("discount_percent")?,
            stock: row.try_get("stock")?,
            track_quantity: row.try_get("track_quantity")?,
            allow_backorder: row.try_get("allow_backorder")?,
            status: status.parse().map_err(|e: MarketplaceError| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: Box::new(e),
            })?,
            purchases: row.try_get("purchases")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|e| MarketplaceError::InvalidInput(format!("{value} out of range: {e}")))
}

fn revision_conflict(entity: &str, id: impl std::fmt::Display, revision: u64) -> MarketplaceError {
    MarketplaceError::Conflict(format!("{entity} {id} was modified concurrently (expected revision {revision})"))
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        Ok(query_as::<Postgres, Product>(GET_PRODUCT_SQL)
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_products(&self, filter: ProductFilter) -> Result<Vec<Product>> {
        let ids: Option<Vec<Uuid>> = filter.ids.map(|ids| ids.into_iter().map(ProductId::into_uuid).collect());
        let limit = filter.page.map(|p| to_i64(p.limit())).transpose()?;
        let offset = filter.page.map_or(Ok(0), |p| to_i64(p.offset()))?;
        Ok(query_as::<Postgres, Product>(FIND_PRODUCTS_SQL)
            .bind(ids)
            .bind(filter.vendor.map(UserId::into_uuid))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn adjust_stock(&self, id: ProductId, delta: i64) -> Result<StockLevel> {
        let adjusted: Option<i64> = query_scalar(ADJUST_STOCK_SQL)
            .bind(id.into_uuid())
            .bind(delta)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(stock) = adjusted {
            return Ok(StockLevel::Tracked(stock));
        }

        // The conditional update matched nothing: work out which condition failed.
        let state = query(STOCK_STATE_SQL).bind(id.into_uuid()).fetch_optional(&self.pool).await?;
        let Some(row) = state else {
            return Err(MarketplaceError::not_found("product", id));
        };
        let (stock, tracked): (i64, bool) = (row.try_get("stock")?, row.try_get("track_quantity")?);
        if !tracked {
            return Ok(StockLevel::Untracked);
        }
        Err(MarketplaceError::InsufficientStock {
            product: id,
            requested: u32::try_from(-delta).unwrap_or(u32::MAX),
            available: stock,
        })
    }

    async fn adjust_purchases(&self, id: ProductId, delta: i64) -> Result<()> {
        let rows_affected = query(ADJUST_PURCHASES_SQL)
            .bind(id.into_uuid())
            .bind(delta)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows_affected == 0 {
            return Err(MarketplaceError::not_found("product", id));
        }
        Ok(())
    }
}

#[async_trait]
impl CartStore for PgStore {
    async fn load_cart(&self, owner: UserId) -> Result<Option<Cart>> {
        let document: Option<Json<Cart>> = query_scalar(LOAD_CART_SQL)
            .bind(owner.into_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(document.map(|Json(cart)| cart))
    }

    async fn save_cart(&self, mut cart: Cart) -> Result<Cart> {
        let expected = cart.revision();
        let next = expected + 1;
        cart.set_revision(next);

        let rows_affected = if expected == 0 {
            query(INSERT_CART_SQL)
                .bind(cart.owner().into_uuid())
                .bind(cart.id().into_uuid())
                .bind(Json(&cart))
                .bind(to_i64(next)?)
                .bind(cart.expires_at())
                .execute(&self.pool)
                .await?
                .rows_affected()
        } else {
            query(UPDATE_CART_SQL)
                .bind(cart.owner().into_uuid())
                .bind(Json(&cart))
                .bind(to_i64(next)?)
                .bind(cart.expires_at())
                .bind(to_i64(expected)?)
                .execute(&self.pool)
                .await?
                .rows_affected()
        };

        if rows_affected == 0 {
            return Err(revision_conflict("cart", cart.id(), expected));
        }
        Ok(cart)
    }

    async fn delete_expired_carts(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(query(DELETE_EXPIRED_CARTS_SQL).bind(now).execute(&self.pool).await?.rows_affected())
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn next_order_sequence(&self) -> Result<u64> {
        let next: i64 = query_scalar(NEXT_ORDER_SEQUENCE_SQL).fetch_one(&self.pool).await?;
        u64::try_from(next).map_err(|e| MarketplaceError::InvalidInput(format!("order sequence {next}: {e}")))
    }

    async fn insert_order(&self, mut order: Order) -> Result<Order> {
        order.set_revision(1);
        let vendors: Vec<Uuid> = order.vendors().into_iter().map(UserId::into_uuid).collect();
        query(INSERT_ORDER_SQL)
            .bind(order.id().into_uuid())
            .bind(order.order_number().as_str())
            .bind(order.user().into_uuid())
            .bind(vendors)
            .bind(order.status().as_str())
            .bind(order.needs_reconciliation())
            .bind(Json(&order))
            .bind(1_i64)
            .bind(order.created_at())
            .execute(&self.pool)
            .await?;
        Ok(order)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let document: Option<Json<Order>> = query_scalar(GET_ORDER_SQL)
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(document.map(|Json(order)| order))
    }

    async fn find_by_order_number(&self, number: &OrderNumber) -> Result<Option<Order>> {
        let document: Option<Json<Order>> = query_scalar(FIND_BY_ORDER_NUMBER_SQL)
            .bind(number.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(document.map(|Json(order)| order))
    }

    async fn replace_order(&self, mut order: Order) -> Result<Order> {
        let expected = order.revision();
        let next = expected + 1;
        order.set_revision(next);
        let rows_affected = query(UPDATE_ORDER_SQL)
            .bind(order.id().into_uuid())
            .bind(order.status().as_str())
            .bind(order.needs_reconciliation())
            .bind(Json(&order))
            .bind(to_i64(next)?)
            .bind(to_i64(expected)?)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows_affected == 0 {
            return match self.get_order(order.id()).await? {
                None => Err(MarketplaceError::not_found("order", order.id())),
                Some(_) => Err(revision_conflict("order", order.order_number(), expected)),
            };
        }
        Ok(order)
    }

    async fn orders_for_user(&self, user: UserId, page: Page) -> Result<Vec<Order>> {
        self.fetch_orders(ORDERS_FOR_USER_SQL, user, page).await
    }

    async fn orders_for_vendor(&self, vendor: UserId, page: Page) -> Result<Vec<Order>> {
        self.fetch_orders(ORDERS_FOR_VENDOR_SQL, vendor, page).await
    }

    async fn orders_needing_reconciliation(&self) -> Result<Vec<Order>> {
        let rows: Vec<Json<Order>> = query_scalar(ORDERS_NEEDING_RECONCILIATION_SQL)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|Json(order)| order).collect())
    }
}

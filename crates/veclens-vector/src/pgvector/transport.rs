//! pgvector transport seam and its diesel-async implementation.

use async_trait::async_trait;
use deadpool::managed::{Object, Pool};
use diesel::pg::Pg;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_types::{Array, BigInt, Double, Integer, Jsonb, Nullable, Text};
use diesel::QueryableByName;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde_json::Value;
use veclens_core::{DistanceMetric, Item, Metadata};

use super::PgVectorConfig;
use super::filter::{SqlParam, SqlWhere, quote_ident};
use crate::TRACING_TARGET_PGVECTOR;
use crate::error::{TransportError, TransportResult};

type ConnectionPool = Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;
type PooledConnection = Object<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Schema facts of a vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgTableInfo {
    /// Declared width of the `embedding` column, if constrained.
    pub dimension: Option<usize>,
    /// Metric of the embedding index operator class.
    pub metric: DistanceMetric,
}

/// One nearest-neighbor row.
#[derive(Debug, Clone, PartialEq)]
pub struct PgHit {
    /// The matched row.
    pub item: Item,
    /// Value of the distance operator.
    pub distance: f32,
}

/// Operations the pgvector adapter needs from a database.
///
/// Each call runs on its own pooled connection; writes run in one
/// transaction.
#[async_trait]
pub trait PgVectorTransport: Send {
    /// Checks the database answers.
    async fn ping(&mut self) -> TransportResult<()>;

    /// Lists tables of the current schema with a `vector` embedding column.
    async fn list_tables(&mut self) -> TransportResult<Vec<String>>;

    /// Creates a vector table and its embedding index.
    async fn create_table(
        &mut self,
        table: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> TransportResult<()>;

    /// Drops a table, `NotFound` if absent.
    async fn drop_table(&mut self, table: &str) -> TransportResult<()>;

    /// Reads the schema facts of a table, `NotFound` if absent.
    async fn table_info(&mut self, table: &str) -> TransportResult<PgTableInfo>;

    /// Inserts or replaces rows, all or nothing.
    async fn upsert(&mut self, table: &str, items: Vec<Item>) -> TransportResult<()>;

    /// Reads rows by id.
    async fn fetch(&mut self, table: &str, ids: &[String]) -> TransportResult<Vec<Item>>;

    /// Reads rows ordered by id.
    async fn select(
        &mut self,
        table: &str,
        filter: Option<&SqlWhere>,
        offset: usize,
        limit: Option<usize>,
    ) -> TransportResult<Vec<Item>>;

    /// Deletes rows by id.
    async fn delete(&mut self, table: &str, ids: &[String]) -> TransportResult<()>;

    /// Deletes every row matching a predicate.
    async fn delete_where(&mut self, table: &str, filter: &SqlWhere) -> TransportResult<()>;

    /// Counts the rows of a table.
    async fn count(&mut self, table: &str) -> TransportResult<u64>;

    /// Returns the `limit` rows closest to `vector`, closest first.
    async fn nearest(
        &mut self,
        table: &str,
        vector: Vec<f32>,
        metric: DistanceMetric,
        filter: Option<&SqlWhere>,
        limit: usize,
    ) -> TransportResult<Vec<PgHit>>;
}

/// Returns the distance operator of a metric.
pub fn distance_operator(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Euclidean => "<->",
        DistanceMetric::Dot => "<#>",
        DistanceMetric::Cosine | DistanceMetric::Unknown => "<=>",
    }
}

/// Returns the index operator class of a metric.
pub fn operator_class(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Euclidean => "vector_l2_ops",
        DistanceMetric::Dot => "vector_ip_ops",
        DistanceMetric::Cosine | DistanceMetric::Unknown => "vector_cosine_ops",
    }
}

/// Reads the metric back from an index definition.
pub fn metric_from_indexdef(indexdef: &str) -> DistanceMetric {
    if indexdef.contains("vector_cosine_ops") {
        DistanceMetric::Cosine
    } else if indexdef.contains("vector_l2_ops") {
        DistanceMetric::Euclidean
    } else if indexdef.contains("vector_ip_ops") {
        DistanceMetric::Dot
    } else {
        DistanceMetric::Unknown
    }
}

#[derive(QueryableByName)]
struct ItemRow {
    #[diesel(sql_type = Text)]
    id: String,
    #[diesel(sql_type = Nullable<Text>)]
    document: Option<String>,
    #[diesel(sql_type = Nullable<Jsonb>)]
    metadata: Option<Value>,
    #[diesel(sql_type = Nullable<pgvector::sql_types::Vector>)]
    embedding: Option<pgvector::Vector>,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        let metadata = match row.metadata {
            Some(Value::Object(map)) => map,
            _ => Metadata::new(),
        };
        Item {
            id: row.id,
            document: row.document,
            metadata,
            embedding: row.embedding.map(|v| v.to_vec()),
        }
    }
}

#[derive(QueryableByName)]
struct HitRow {
    #[diesel(embed)]
    item: ItemRow,
    #[diesel(sql_type = Double)]
    distance: f64,
}

#[derive(QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(QueryableByName)]
struct TypmodRow {
    #[diesel(sql_type = Integer)]
    typmod: i32,
}

#[derive(QueryableByName)]
struct IndexRow {
    #[diesel(sql_type = Text)]
    indexdef: String,
}

const SELECT_COLUMNS: &str = "\"id\", \"document\", \"metadata\", \"embedding\"";

fn bind_all<'f>(
    mut query: BoxedSqlQuery<'f, Pg, SqlQuery>,
    params: Vec<SqlParam>,
) -> BoxedSqlQuery<'f, Pg, SqlQuery> {
    for param in params {
        query = match param {
            SqlParam::Text(v) => query.bind::<Text, _>(v),
            SqlParam::Float(v) => query.bind::<Double, _>(v),
            SqlParam::TextArray(v) => query.bind::<Array<Text>, _>(v),
            SqlParam::BigInt(v) => query.bind::<BigInt, _>(v),
            SqlParam::Json(v) => query.bind::<Jsonb, _>(v),
        };
    }
    query
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// [`PgVectorTransport`] over a diesel-async connection pool.
pub struct DieselPgVectorTransport {
    pool: ConnectionPool,
    index_lists: usize,
}

impl DieselPgVectorTransport {
    /// Builds the pool. No connection is opened until the first call.
    pub fn new(config: &PgVectorConfig) -> TransportResult<Self> {
        let manager =
            AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.connection_url);
        let pool = Pool::builder(manager)
            .max_size(config.pool_size.max(1))
            .wait_timeout(Some(config.timeout()))
            .create_timeout(Some(config.timeout()))
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| {
                tracing::error!(
                    target: TRACING_TARGET_PGVECTOR,
                    error = %e,
                    url = %config.connection_url_masked(),
                    "Failed to build connection pool"
                );
                TransportError::pool(e)
            })?;

        Ok(Self {
            pool,
            index_lists: config.index_lists.max(1),
        })
    }

    async fn connection(&self) -> TransportResult<PooledConnection> {
        self.pool.get().await.map_err(|e| {
            tracing::error!(
                target: TRACING_TARGET_PGVECTOR,
                error = %e,
                "Failed to acquire connection from pool"
            );
            TransportError::pool(e)
        })
    }

    async fn exists(&self, conn: &mut AsyncPgConnection, table: &str) -> TransportResult<bool> {
        let rows: Vec<NameRow> = diesel::sql_query(
            "SELECT c.relname AS name FROM pg_class c \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE c.relname = $1 AND n.nspname = current_schema() AND c.relkind = 'r'",
        )
        .bind::<Text, _>(table)
        .load(conn)
        .await?;
        Ok(!rows.is_empty())
    }

    async fn require(&self, conn: &mut AsyncPgConnection, table: &str) -> TransportResult<()> {
        if self.exists(conn, table).await? {
            Ok(())
        } else {
            Err(TransportError::not_found(format!("table '{}'", table)))
        }
    }
}

impl std::fmt::Debug for DieselPgVectorTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DieselPgVectorTransport")
            .field("index_lists", &self.index_lists)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PgVectorTransport for DieselPgVectorTransport {
    async fn ping(&mut self) -> TransportResult<()> {
        let mut conn = self.connection().await?;
        let _: CountRow = diesel::sql_query("SELECT 1::bigint AS count")
            .get_result(&mut *conn)
            .await?;
        Ok(())
    }

    async fn list_tables(&mut self) -> TransportResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let rows: Vec<NameRow> = diesel::sql_query(
            "SELECT DISTINCT c.relname AS name FROM pg_attribute a \
             JOIN pg_class c ON c.oid = a.attrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             JOIN pg_type t ON t.oid = a.atttypid \
             WHERE t.typname = 'vector' AND NOT a.attisdropped \
             AND n.nspname = current_schema() AND c.relkind = 'r' \
             ORDER BY name",
        )
        .load(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(|row| row.name).collect())
    }

    async fn create_table(
        &mut self,
        table: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> TransportResult<()> {
        let mut conn = self.connection().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        diesel::sql_query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(conn)
            .await?;

        let create = format!(
            "CREATE TABLE {} (\"id\" TEXT PRIMARY KEY, \"document\" TEXT, \
             \"metadata\" JSONB NOT NULL DEFAULT '{{}}'::jsonb, \"embedding\" vector({}))",
            quote_ident(table),
            dimension
        );
        let index = format!(
            "CREATE INDEX {} ON {} USING ivfflat (\"embedding\" {}) WITH (lists = {})",
            quote_ident(&format!("{}_embedding_idx", table)),
            quote_ident(table),
            operator_class(metric),
            self.index_lists
        );

        conn.transaction::<_, TransportError, _>(|conn| {
            async move {
                diesel::sql_query(create).execute(conn).await?;
                diesel::sql_query(index).execute(conn).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn drop_table(&mut self, table: &str) -> TransportResult<()> {
        let mut conn = self.connection().await?;
        self.require(&mut conn, table).await?;
        diesel::sql_query(format!("DROP TABLE {}", quote_ident(table)))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn table_info(&mut self, table: &str) -> TransportResult<PgTableInfo> {
        let mut conn = self.connection().await?;
        self.require(&mut conn, table).await?;

        let typmods: Vec<TypmodRow> = diesel::sql_query(
            "SELECT a.atttypmod AS typmod FROM pg_attribute a \
             JOIN pg_class c ON c.oid = a.attrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE c.relname = $1 AND n.nspname = current_schema() \
             AND a.attname = 'embedding' AND NOT a.attisdropped",
        )
        .bind::<Text, _>(table)
        .load(&mut *conn)
        .await?;
        let dimension = typmods
            .as_slice()
            .first()
            .and_then(|row| usize::try_from(row.typmod).ok())
            .filter(|&width| width > 0);

        let indexes: Vec<IndexRow> = diesel::sql_query(
            "SELECT indexdef FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = $1",
        )
        .bind::<Text, _>(table)
        .load(&mut *conn)
        .await?;
        let metric = indexes
            .iter()
            .map(|row| metric_from_indexdef(&row.indexdef))
            .find(|metric| *metric != DistanceMetric::Unknown)
            .unwrap_or(DistanceMetric::Unknown);

        Ok(PgTableInfo { dimension, metric })
    }

    async fn upsert(&mut self, table: &str, items: Vec<Item>) -> TransportResult<()> {
        let mut conn = self.connection().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let sql = format!(
            "INSERT INTO {} (\"id\", \"document\", \"metadata\", \"embedding\") \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (\"id\") DO UPDATE SET \"document\" = EXCLUDED.\"document\", \
             \"metadata\" = EXCLUDED.\"metadata\", \"embedding\" = EXCLUDED.\"embedding\"",
            quote_ident(table)
        );

        conn.transaction::<_, TransportError, _>(|conn| {
            async move {
                for item in items {
                    diesel::sql_query(sql.as_str())
                        .bind::<Text, _>(item.id)
                        .bind::<Nullable<Text>, _>(item.document)
                        .bind::<Jsonb, _>(Value::Object(item.metadata))
                        .bind::<Nullable<pgvector::sql_types::Vector>, _>(
                            item.embedding.map(pgvector::Vector::from),
                        )
                        .execute(conn)
                        .await?;
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn fetch(&mut self, table: &str, ids: &[String]) -> TransportResult<Vec<Item>> {
        let mut conn = self.connection().await?;
        self.require(&mut conn, table).await?;
        let rows: Vec<ItemRow> = diesel::sql_query(format!(
            "SELECT {} FROM {} WHERE \"id\" = ANY($1)",
            SELECT_COLUMNS,
            quote_ident(table)
        ))
        .bind::<Array<Text>, _>(ids.to_vec())
        .load(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(Item::from).collect())
    }

    async fn select(
        &mut self,
        table: &str,
        filter: Option<&SqlWhere>,
        offset: usize,
        limit: Option<usize>,
    ) -> TransportResult<Vec<Item>> {
        let mut conn = self.connection().await?;
        self.require(&mut conn, table).await?;

        let mut params = Vec::new();
        let predicate = filter.map(|f| f.render(&mut params));
        let mut sql = format!("SELECT {} FROM {}", SELECT_COLUMNS, quote_ident(table));
        if let Some(predicate) = predicate {
            sql.push_str(&format!(" WHERE {}", predicate));
        }
        sql.push_str(" ORDER BY \"id\"");
        if let Some(limit) = limit {
            params.push(SqlParam::BigInt(to_i64(limit)));
            sql.push_str(&format!(" LIMIT ${}", params.len()));
        }
        params.push(SqlParam::BigInt(to_i64(offset)));
        sql.push_str(&format!(" OFFSET ${}", params.len()));

        let rows: Vec<ItemRow> = bind_all(diesel::sql_query(sql).into_boxed(), params)
            .load(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(Item::from).collect())
    }

    async fn delete(&mut self, table: &str, ids: &[String]) -> TransportResult<()> {
        let mut conn = self.connection().await?;
        self.require(&mut conn, table).await?;
        diesel::sql_query(format!(
            "DELETE FROM {} WHERE \"id\" = ANY($1)",
            quote_ident(table)
        ))
        .bind::<Array<Text>, _>(ids.to_vec())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn delete_where(&mut self, table: &str, filter: &SqlWhere) -> TransportResult<()> {
        let mut conn = self.connection().await?;
        self.require(&mut conn, table).await?;

        let mut params = Vec::new();
        let predicate = filter.render(&mut params);
        let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table), predicate);
        bind_all(diesel::sql_query(sql).into_boxed(), params)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn count(&mut self, table: &str) -> TransportResult<u64> {
        let mut conn = self.connection().await?;
        self.require(&mut conn, table).await?;
        let row: CountRow = diesel::sql_query(format!(
            "SELECT COUNT(*) AS count FROM {}",
            quote_ident(table)
        ))
        .get_result(&mut *conn)
        .await?;
        Ok(u64::try_from(row.count).unwrap_or_default())
    }

    async fn nearest(
        &mut self,
        table: &str,
        vector: Vec<f32>,
        metric: DistanceMetric,
        filter: Option<&SqlWhere>,
        limit: usize,
    ) -> TransportResult<Vec<PgHit>> {
        let mut conn = self.connection().await?;
        self.require(&mut conn, table).await?;

        let mut params = Vec::new();
        let predicate = filter
            .map(|f| f.render(&mut params))
            .unwrap_or_else(|| "TRUE".to_string());
        let vector_param = params.len() + 1;
        let limit_param = params.len() + 2;
        let sql = format!(
            "SELECT {columns}, (\"embedding\" {op} ${vector_param})::double precision AS distance \
             FROM {table} WHERE \"embedding\" IS NOT NULL AND {predicate} \
             ORDER BY distance ASC LIMIT ${limit_param}",
            columns = SELECT_COLUMNS,
            op = distance_operator(metric),
            table = quote_ident(table),
        );

        let rows: Vec<HitRow> = bind_all(diesel::sql_query(sql).into_boxed(), params)
            .bind::<pgvector::sql_types::Vector, _>(pgvector::Vector::from(vector))
            .bind::<BigInt, _>(to_i64(limit))
            .load(&mut *conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| PgHit {
                item: row.item.into(),
                distance: row.distance as f32,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_round_trips_through_indexdef() {
        for metric in [DistanceMetric::Cosine, DistanceMetric::Euclidean, DistanceMetric::Dot] {
            let indexdef = format!(
                "CREATE INDEX docs_embedding_idx ON public.docs USING ivfflat (embedding {}) WITH (lists='100')",
                operator_class(metric)
            );
            assert_eq!(metric_from_indexdef(&indexdef), metric);
        }
        assert_eq!(
            metric_from_indexdef("CREATE UNIQUE INDEX docs_pkey ON public.docs USING btree (id)"),
            DistanceMetric::Unknown
        );
    }

    #[test]
    fn test_operators_match_classes() {
        assert_eq!(distance_operator(DistanceMetric::Cosine), "<=>");
        assert_eq!(distance_operator(DistanceMetric::Euclidean), "<->");
        assert_eq!(distance_operator(DistanceMetric::Dot), "<#>");
    }

    #[test]
    fn test_row_without_metadata_object() {
        let row = ItemRow {
            id: "a".into(),
            document: Some("text".into()),
            metadata: Some(Value::Null),
            embedding: Some(pgvector::Vector::from(vec![1.0, 2.0])),
        };
        let item = Item::from(row);
        assert!(item.metadata.is_empty());
        assert_eq!(item.embedding, Some(vec![1.0, 2.0]));
    }
}

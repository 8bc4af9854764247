//! Sharded entity store.
//!
//! Single-id operations go straight to the shard the id resolves to.
//! Multi-id operations are split by shard and fanned out through a
//! [`ParallelTaskGroup`], one unit per non-empty partition. Whole-table
//! scans (`dump*`) walk the shards one by one; uniform reads and writes
//! (`query_all_shards*`, `update_all_shards*`) run on every shard in
//! parallel.
//!
//! No operation spans shards atomically.

pub mod dumper;

use crate::cluster::{NamedShardExecutor, ShardCluster, ShardExecutor};
use crate::core::{DbError, Result, Row, Value};
use crate::orm::mapper::{ID_COLUMN, id_predicate};
use crate::orm::{Entity, EntityMapper};
use crate::sql::NamedParams;
use crate::task::{ParallelTaskGroup, ShardTaskExecutor};
use dumper::DumpHandler;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub use dumper::ObjectDumper;

/// Callback receiving each entity of a parallel scan.
pub type EntityCallback<T> = Arc<dyn Fn(T) + Send + Sync>;

pub struct ShardedEntityStore<T: Entity> {
    cluster: Arc<ShardCluster>,
    tasks: ShardTaskExecutor,
    mapper: Arc<EntityMapper<T>>,
}

impl<T: Entity> Clone for ShardedEntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
            tasks: self.tasks.clone(),
            mapper: Arc::clone(&self.mapper),
        }
    }
}

impl<T: Entity> ShardedEntityStore<T> {
    pub fn new(
        cluster: Arc<ShardCluster>,
        tasks: ShardTaskExecutor,
        mapper: Arc<EntityMapper<T>>,
    ) -> Self {
        Self {
            cluster,
            tasks,
            mapper,
        }
    }

    /// Number of virtual shards.
    pub fn shard_size(&self) -> u32 {
        self.cluster.virtual_size()
    }

    pub fn mapper(&self) -> &Arc<EntityMapper<T>> {
        &self.mapper
    }

    pub fn cluster(&self) -> &Arc<ShardCluster> {
        &self.cluster
    }

    pub fn task_executor(&self) -> &ShardTaskExecutor {
        &self.tasks
    }

    pub fn shard_for_id(&self, id: &str) -> u32 {
        self.cluster.shard_for_id(id)
    }

    pub fn executor(&self, shard: u32) -> Result<ShardExecutor> {
        self.cluster.executor(shard)
    }

    pub fn named_executor(&self, shard: u32) -> Result<NamedShardExecutor> {
        self.cluster.named_executor(shard)
    }

    pub fn executor_for_id(&self, id: &str) -> Result<ShardExecutor> {
        self.executor(self.shard_for_id(id))
    }

    pub fn named_executor_for_id(&self, id: &str) -> Result<NamedShardExecutor> {
        self.named_executor(self.shard_for_id(id))
    }

    // ----- single id -----

    /// The first row stored under `id`. Duplicate rows are not an error
    /// here; use [`EntityMapper::get_by_id`] to have them reported.
    pub async fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self.get_all(id).await?.into_iter().next())
    }

    /// Every row stored under `id`.
    pub async fn get_all(&self, id: &str) -> Result<Vec<T>> {
        let exec = self.named_executor_for_id(id)?;
        self.mapper.query(&exec, &id_predicate(id), &[]).await
    }

    /// Inserts the entity on its shard, generating the id first if unset.
    pub async fn insert(&self, entity: &mut T) -> Result<u64> {
        let id = self.mapper.assign_id_if_missing(entity)?;
        let exec = self.named_executor_for_id(&id)?;
        self.mapper.insert(&exec, entity).await
    }

    /// Inserts or overwrites the entity on its shard.
    ///
    /// Uses the native upsert when the mapper supports it. Otherwise the row
    /// is read by id, then inserted or updated; the read and the write are
    /// separate statements, so concurrent replacers of one id race and the
    /// last write wins.
    pub async fn replace(&self, entity: &mut T) -> Result<u64> {
        let had_id = self.mapper.object_id(entity).is_some();
        let id = self.mapper.assign_id_if_missing(entity)?;
        let exec = self.named_executor_for_id(&id)?;

        if self.mapper.is_replace_supported() {
            return self.mapper.replace(&exec, entity).await;
        }

        // A freshly generated id cannot exist yet.
        let exists = had_id
            && !self
                .mapper
                .query(&exec, &id_predicate(&id), &[ID_COLUMN])
                .await?
                .is_empty();
        if exists {
            self.mapper.update_entity(&exec, entity).await
        } else {
            self.mapper.insert(&exec, entity).await
        }
    }

    /// Replaces entities one at a time, stopping at the first failure.
    /// Entities replaced before the failure stay written.
    pub async fn replace_all(&self, entities: &mut [T]) -> Result<()> {
        for (index, entity) in entities.iter_mut().enumerate() {
            if let Err(err) = self.replace(entity).await {
                return Err(DbError::BatchReplaceFailed {
                    index,
                    id: self.mapper.object_id(entity),
                    source: Box::new(err),
                });
            }
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<u64> {
        let exec = self.named_executor_for_id(id)?;
        self.mapper.delete(&exec, &id_predicate(id)).await
    }

    // ----- multi id -----

    /// Groups ids by the shard they resolve to.
    pub fn split_ids_by_shard(&self, ids: &[String]) -> BTreeMap<u32, Vec<String>> {
        let mut partitions: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for id in ids {
            partitions
                .entry(self.shard_for_id(id))
                .or_default()
                .push(id.clone());
        }
        partitions
    }

    /// Entities for the given ids, in no particular order. Missing ids are
    /// skipped.
    pub async fn get_many(&self, ids: &[String]) -> Result<Vec<T>> {
        let sql = format!(
            "select * from {} where {} in (:ids)",
            self.mapper.table_name(),
            ID_COLUMN
        );
        let found = Arc::new(Mutex::new(Vec::<T>::new()));

        self.fan_out(self.split_ids_by_shard(ids), |exec, subset| {
            let mapper = Arc::clone(&self.mapper);
            let found = Arc::clone(&found);
            let sql = sql.clone();
            async move {
                let params = NamedParams::new().with("ids", subset);
                let entities = mapper.query_by_sql(&exec, &sql, &params).await?;
                found.lock()?.extend(entities);
                Ok::<_, DbError>(())
            }
        })
        .await?;

        Ok(std::mem::take(&mut *found.lock()?))
    }

    /// Deletes the given ids. Returns the number of rows removed.
    pub async fn remove_many(&self, ids: &[String]) -> Result<u64> {
        let sql = format!(
            "delete from {} where {} in (:ids)",
            self.mapper.table_name(),
            ID_COLUMN
        );
        let removed = Arc::new(AtomicU64::new(0));

        self.fan_out(self.split_ids_by_shard(ids), |exec, subset| {
            let removed = Arc::clone(&removed);
            let sql = sql.clone();
            async move {
                let params = NamedParams::new().with("ids", subset);
                let count = exec.update(&sql, &params).await?;
                removed.fetch_add(count, Ordering::SeqCst);
                Ok::<_, DbError>(())
            }
        })
        .await?;

        Ok(removed.load(Ordering::SeqCst))
    }

    /// The subset of `ids` that is stored.
    pub async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let sql = format!(
            "select {} from {} where {} in (:ids)",
            ID_COLUMN,
            self.mapper.table_name(),
            ID_COLUMN
        );
        let existing = Arc::new(Mutex::new(HashSet::<String>::new()));

        self.fan_out(self.split_ids_by_shard(ids), |exec, subset| {
            let existing = Arc::clone(&existing);
            let sql = sql.clone();
            async move {
                let params = NamedParams::new().with("ids", subset);
                let found: Vec<String> = exec.query_for_list(&sql, &params).await?;
                existing.lock()?.extend(found);
                Ok::<_, DbError>(())
            }
        })
        .await?;

        Ok(std::mem::take(&mut *existing.lock()?))
    }

    /// The subset of `ids` that is not stored.
    pub async fn nonexisting_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let existing = self.existing_ids(ids).await?;
        Ok(ids
            .iter()
            .filter(|id| !existing.contains(*id))
            .cloned()
            .collect())
    }

    // ----- whole cluster, sequential -----

    /// Streams every entity of every shard into `dumper`, shard 0 first.
    /// Row order within a shard is whatever the database returns.
    pub async fn dump(&self, dumper: &mut dyn ObjectDumper<T>) -> Result<u64> {
        let sql = format!("select * from {}", self.mapper.table_name());
        self.dump_with_sql(&sql, dumper).await
    }

    pub async fn dump_with_sql(&self, sql: &str, dumper: &mut dyn ObjectDumper<T>) -> Result<u64> {
        let mut total = 0;
        for shard in 0..self.shard_size() {
            total += self.dump_shard_with_sql(sql, dumper, shard).await?;
        }
        debug!(table = %self.mapper.table_name(), rows = total, "dump finished");
        Ok(total)
    }

    pub async fn dump_shard(&self, dumper: &mut dyn ObjectDumper<T>, shard: u32) -> Result<u64> {
        let sql = format!("select * from {}", self.mapper.table_name());
        self.dump_shard_with_sql(&sql, dumper, shard).await
    }

    async fn dump_shard_with_sql(
        &self,
        sql: &str,
        dumper: &mut dyn ObjectDumper<T>,
        shard: u32,
    ) -> Result<u64> {
        let exec = self.named_executor(shard)?;
        let mut handler = DumpHandler {
            mapper: self.mapper.as_ref(),
            dumper,
        };
        exec.for_each_row(sql, &NamedParams::new(), &mut handler).await
    }

    // ----- whole cluster, parallel -----

    /// Runs a positional query on every shard and merges the entities.
    pub async fn query_all_shards(&self, sql: &str, args: &[Value]) -> Result<Vec<T>> {
        let found = Arc::new(Mutex::new(Vec::<T>::new()));
        self.fan_out(self.all_shards(), |exec, ()| {
            let mapper = Arc::clone(&self.mapper);
            let found = Arc::clone(&found);
            let sql = sql.to_string();
            let args = args.to_vec();
            async move {
                let entities = mapper
                    .query_by_sql_positional(exec.positional(), &sql, &args)
                    .await?;
                found.lock()?.extend(entities);
                Ok::<_, DbError>(())
            }
        })
        .await?;

        Ok(std::mem::take(&mut *found.lock()?))
    }

    pub async fn query_all_shards_named(&self, sql: &str, params: &NamedParams) -> Result<Vec<T>> {
        let found = Arc::new(Mutex::new(Vec::<T>::new()));
        self.fan_out(self.all_shards(), |exec, ()| {
            let mapper = Arc::clone(&self.mapper);
            let found = Arc::clone(&found);
            let sql = sql.to_string();
            let params = params.clone();
            async move {
                let entities = mapper.query_by_sql(&exec, &sql, &params).await?;
                found.lock()?.extend(entities);
                Ok::<_, DbError>(())
            }
        })
        .await?;

        Ok(std::mem::take(&mut *found.lock()?))
    }

    /// Parallel scan handing each entity to `callback`. The callback may run
    /// on several shards' tasks at once.
    pub async fn query_all_shards_with(
        &self,
        sql: &str,
        params: &NamedParams,
        callback: EntityCallback<T>,
    ) -> Result<()> {
        self.fan_out(self.all_shards(), |exec, ()| {
            let mapper = Arc::clone(&self.mapper);
            let callback = Arc::clone(&callback);
            let sql = sql.to_string();
            let params = params.clone();
            async move {
                let mut handler = |row: Row| -> Result<()> {
                    callback(mapper.map_row(row)?);
                    Ok(())
                };
                exec.for_each_row(&sql, &params, &mut handler).await?;
                Ok::<_, DbError>(())
            }
        })
        .await
    }

    /// Runs a positional statement on every shard. Returns the total
    /// affected row count.
    pub async fn update_all_shards(&self, sql: &str, args: &[Value]) -> Result<u64> {
        let work = self.all_shards().map(|(shard, ())| (shard, args.to_vec()));
        self.update_positional(sql, work).await
    }

    pub async fn update_all_shards_named(&self, sql: &str, params: &NamedParams) -> Result<u64> {
        let updated = Arc::new(AtomicU64::new(0));
        self.fan_out(self.all_shards(), |exec, ()| {
            let updated = Arc::clone(&updated);
            let sql = sql.to_string();
            let params = params.clone();
            async move {
                let count = exec.update(&sql, &params).await?;
                updated.fetch_add(count, Ordering::SeqCst);
                Ok::<_, DbError>(())
            }
        })
        .await?;

        Ok(updated.load(Ordering::SeqCst))
    }

    /// Runs `sql` on every shard with that shard's own arguments;
    /// `args_per_shard[n]` goes to shard `n`.
    pub async fn update_all_shards_each(
        &self,
        sql: &str,
        args_per_shard: Vec<Vec<Value>>,
    ) -> Result<u64> {
        if args_per_shard.len() != self.shard_size() as usize {
            return Err(DbError::ParameterError(format!(
                "expected arguments for {} shards, got {}",
                self.shard_size(),
                args_per_shard.len()
            )));
        }
        let work = (0..self.shard_size()).zip(args_per_shard);
        self.update_positional(sql, work).await
    }

    /// Runs `sql` only on the listed shards, each with its own arguments.
    pub async fn update_shards(
        &self,
        sql: &str,
        args_by_shard: BTreeMap<u32, Vec<Value>>,
    ) -> Result<u64> {
        self.update_positional(sql, args_by_shard).await
    }

    /// Creates the mapped table on every shard, typed for each shard's
    /// dialect.
    pub async fn create_schema(&self) -> Result<()> {
        self.fan_out(self.all_shards(), |exec, ()| {
            let ddl = self.mapper.create_table_sql(exec.dialect());
            async move {
                exec.execute(&ddl).await?;
                Ok::<_, DbError>(())
            }
        })
        .await
    }

    /// Runs caller-supplied DDL on every shard.
    pub async fn create_schema_with(&self, ddl: &str) -> Result<()> {
        self.fan_out(self.all_shards(), |exec, ()| {
            let ddl = ddl.to_string();
            async move {
                exec.execute(&ddl).await?;
                Ok::<_, DbError>(())
            }
        })
        .await
    }

    // ----- fan-out plumbing -----

    fn all_shards(&self) -> impl Iterator<Item = (u32, ())> {
        (0..self.shard_size()).map(|shard| (shard, ()))
    }

    async fn update_positional(
        &self,
        sql: &str,
        work: impl IntoIterator<Item = (u32, Vec<Value>)>,
    ) -> Result<u64> {
        let updated = Arc::new(AtomicU64::new(0));
        self.fan_out(work, |exec, args| {
            let updated = Arc::clone(&updated);
            let sql = sql.to_string();
            async move {
                let count = exec.positional().update(&sql, &args).await?;
                updated.fetch_add(count, Ordering::SeqCst);
                Ok::<_, DbError>(())
            }
        })
        .await?;

        Ok(updated.load(Ordering::SeqCst))
    }

    /// One unit per `(shard, input)` pair, run on the store's task executor.
    async fn fan_out<A, F, Fut>(
        &self,
        work: impl IntoIterator<Item = (u32, A)>,
        mut unit: F,
    ) -> Result<()>
    where
        F: FnMut(NamedShardExecutor, A) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut group = ParallelTaskGroup::new();
        for (shard, input) in work {
            let exec = self.named_executor(shard)?;
            let future = unit(exec, input);
            group.add_task(shard, move |_| future);
        }

        debug!(
            table = %self.mapper.table_name(),
            units = group.len(),
            "fanning out across shards"
        );
        group.execute(&self.tasks).await
    }
}

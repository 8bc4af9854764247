use crate::cluster::RowHandler;
use crate::core::{Result, Row};
use crate::orm::{Entity, EntityMapper};
use async_trait::async_trait;

/// Sink for whole-table scans.
///
/// Receives every entity exactly once, one shard after another.
#[async_trait]
pub trait ObjectDumper<T: Send>: Send {
    async fn dump(&mut self, entity: T) -> Result<()>;
}

/// Collects dumped entities in memory.
#[async_trait]
impl<T: Send> ObjectDumper<T> for Vec<T> {
    async fn dump(&mut self, entity: T) -> Result<()> {
        self.push(entity);
        Ok(())
    }
}

/// Maps streamed rows and forwards them to a dumper.
pub(crate) struct DumpHandler<'a, T: Entity> {
    pub(crate) mapper: &'a EntityMapper<T>,
    pub(crate) dumper: &'a mut dyn ObjectDumper<T>,
}

#[async_trait]
impl<'a, T: Entity> RowHandler for DumpHandler<'a, T> {
    async fn handle(&mut self, row: Row) -> Result<()> {
        let entity = self.mapper.map_row(row)?;
        self.dumper.dump(entity).await
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::core::{Entity, FieldValue, Result, Value};
use crate::filter::FilterExpression;
use crate::request::{EntityProjection, Sorting};

/// How much of a filter the backend evaluates itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSupport {
    /// The backend applies the filter exactly
    Full,
    /// The backend narrows the result; the core filters again in memory
    Partial,
    /// The core filters in memory
    None,
}

pub type EntityStream = BoxStream<'static, Result<Entity>>;

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn begin_transaction(&self) -> Result<Arc<dyn DataStoreTransaction>>;

    async fn begin_read_transaction(&self) -> Result<Arc<dyn DataStoreTransaction>> {
        self.begin_transaction().await
    }
}

/// One backend transaction, owned by one request.
#[async_trait]
pub trait DataStoreTransaction: Send + Sync {
    /// Instantiates an empty object of `type_name`. Nothing is persisted yet.
    async fn create_new_object(&self, type_name: &str) -> Result<Entity> {
        Ok(Entity::new(type_name))
    }

    async fn load_object(
        &self,
        projection: &EntityProjection,
        id: &Value,
        filter: Option<&FilterExpression>,
    ) -> Result<Option<Entity>>;

    /// Single-pass stream over matching objects. Consuming it twice requires
    /// a second call.
    async fn load_objects(&self, projection: &EntityProjection) -> Result<EntityStream>;

    async fn create_object(&self, entity: &Entity) -> Result<()>;

    async fn save(&self, entity: &Entity) -> Result<()>;

    async fn delete(&self, entity: &Entity) -> Result<()>;

    async fn flush(&self) -> Result<()>;

    async fn pre_commit(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()>;

    /// Current value of a relationship. `None` when the field was never set.
    async fn get_relation(&self, entity: &Entity, field: &str) -> Result<Option<FieldValue>> {
        entity.get(field)
    }

    fn get_attribute(&self, entity: &Entity, field: &str) -> Result<Value> {
        entity.attribute(field)
    }

    fn set_attribute(&self, entity: &Entity, field: &str, value: Value) -> Result<()> {
        entity.set_attribute(field, value)
    }

    fn update_to_one_relation(&self, _entity: &Entity, _field: &str, _related: Option<&Entity>) -> Result<()> {
        Ok(())
    }

    fn update_to_many_relation(
        &self,
        _entity: &Entity,
        _field: &str,
        _added: &[Entity],
        _deleted: &[Entity],
    ) -> Result<()> {
        Ok(())
    }

    fn supports_filtering(&self, _type_name: &str, _filter: &FilterExpression) -> FeatureSupport {
        FeatureSupport::None
    }

    fn supports_sorting(&self, _type_name: &str, _sorting: &Sorting) -> bool {
        false
    }

    fn supports_pagination(&self, _type_name: &str, _filter: Option<&FilterExpression>) -> bool {
        false
    }

    /// Best-effort abort of running backend work.
    fn cancel(&self) {}

    /// Releases the transaction. Uncommitted work is discarded.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

//! Type-aware export of a key-value store into write commands
//!
//! Each data type is walked by its own [`Coordinator`]: strings from one
//! point-in-time snapshot (or a live cursor, if configured), the four
//! collection types from a live cursor. Every key becomes one or more
//! bounded write commands plus an optional trailing `EXPIRE`, handed to a
//! pool of senders through a shared [`Dispatcher`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod batch;
mod command;
mod config;
mod coordinator;
mod cursor;
mod dispatch;
mod error;
mod progress;
mod ttl;

pub use batch::Batches;
pub use command::{CommandElement, Operation, WireCommand, format_score};
pub use config::{Consistency, MAX_SCAN_PAGE_SIZE, MigrationConfig, RoutingPolicy};
pub use coordinator::Coordinator;
pub use cursor::KeyCursor;
pub use dispatch::{DispatchUnit, Dispatcher};
pub use error::{MigrateError, MigrateResult};
pub use progress::{KeyOutcome, MigrationCounter, MigrationReport, Outcome};
pub use ttl::{StringExpiry, collection_expiry, string_expiry};

use std::sync::Arc;

use kvport_sender::Sender;
use kvport_source::{DataType, SourceEngine};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Result of migrating one data type
pub type TypeResult = (DataType, MigrateResult<MigrationReport>);

/// Parse data type names, rejecting unknown ones
pub fn parse_types<I, T>(names: I) -> MigrateResult<Vec<DataType>>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    let mut types = Vec::new();
    for name in names {
        let data_type = name.as_ref().parse::<DataType>()?;
        if !types.contains(&data_type) {
            types.push(data_type);
        }
    }
    Ok(types)
}

/// Migrate several data types concurrently
///
/// One coordinator per type runs on its own task; they share the engine, the
/// dispatcher and the counter. A fatal error in one type does not stop the
/// others. Results come back in the order of `types`.
pub async fn migrate_all<E, S>(
    engine: E,
    dispatcher: Arc<Dispatcher<S>>,
    config: MigrationConfig,
    types: &[DataType],
    counter: MigrationCounter,
    cancel: CancellationToken,
) -> MigrateResult<Vec<TypeResult>>
where
    E: SourceEngine,
    S: Sender,
{
    config.validate()?;

    let mut tasks = JoinSet::new();
    let mut order = Vec::new();
    for &data_type in types {
        if order.contains(&data_type) {
            continue;
        }
        order.push(data_type);

        let coordinator = Coordinator::new(
            engine.clone(),
            Arc::clone(&dispatcher),
            config.clone(),
            data_type,
            counter.clone(),
            cancel.clone(),
        );
        tasks.spawn(async move { (data_type, coordinator.run().await) });
    }

    info!(
        "Started {} migrations across {} senders",
        order.len(),
        dispatcher.len()
    );

    let mut results = Vec::with_capacity(order.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!("Migration task failed: {}", e),
        }
    }

    // A task that panicked leaves a gap; report it against its type
    for &data_type in &order {
        if !results.iter().any(|(t, _)| *t == data_type) {
            results.push((
                data_type,
                Err(MigrateError::Task(format!("{data_type} migration did not finish"))),
            ));
        }
    }
    results.sort_by_key(|(t, _)| order.iter().position(|o| o == t));

    Ok(results)
}

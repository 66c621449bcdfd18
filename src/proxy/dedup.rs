//! Merging of per-source results into one catalog

use crate::proxy::models::{Catalog, Protocol, SourceResult};
use tracing::info;

/// Union every source result, protocol by protocol.
///
/// The output does not depend on the order of the inputs, and merging a
/// result twice changes nothing.
pub fn merge<'a, I>(results: I) -> Catalog
where
    I: IntoIterator<Item = &'a SourceResult>,
{
    let mut catalog = Catalog::new();
    for result in results {
        catalog.extend(result.clone());
    }

    for protocol in Protocol::ALL {
        info!("{} unique {} proxies", catalog.count(protocol), protocol);
    }
    catalog
}

//! Sequential acquisition over one search's results.

use std::collections::HashSet;

use futures::Stream;
use mps_adapters::{parse_search_results, ListingSource, NavigatorError, ParseError, SearchParams};
use mps_core::RawArtifactBundle;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub search: SearchParams,
    /// `None` (or zero) fetches every result.
    pub limit: Option<usize>,
    pub skip: HashSet<String>,
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("search failed")]
    Search(#[source] NavigatorError),
    #[error("search export could not be read")]
    Export(#[source] ParseError),
}

#[derive(Debug)]
pub enum AcquisitionEvent {
    Skipped { idn: String },
    Fetched { idn: String, bundle: Box<RawArtifactBundle> },
    Failed { idn: String, error: NavigatorError },
}

/// A search that already ran, and the listings still to fetch from it.
pub struct Acquisition<'a, S: ListingSource + ?Sized> {
    source: &'a mut S,
    worklist: Vec<String>,
    skip: HashSet<String>,
    expected: usize,
}

impl<'a, S: ListingSource + ?Sized> Acquisition<'a, S> {
    /// Runs the search. Any failure here is fatal for the run.
    pub async fn start(source: &'a mut S, request: AcquisitionRequest) -> Result<Self, AcquisitionError> {
        let export = source
            .search(&request.search)
            .await
            .map_err(AcquisitionError::Search)?;
        let worklist: Vec<String> = match export {
            Some(file) => parse_search_results(&file.content)
                .map_err(AcquisitionError::Export)?
                .into_iter()
                .map(|result| result.idn)
                .collect(),
            None => Vec::new(),
        };
        let expected = match request.limit.filter(|&limit| limit > 0) {
            Some(limit) => limit.min(worklist.len()),
            None => worklist.len(),
        };
        info!(
            results = worklist.len(),
            expected,
            skip = request.skip.len(),
            "search finished; expected count assumes nothing is skipped"
        );
        Ok(Self {
            source,
            worklist,
            skip: request.skip,
            expected,
        })
    }

    /// Listings expected before any skip.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Yields one event per visited identifier, in search order. Each skip
    /// lowers the expected count by one; fetching stops once that many
    /// listings were fetched, or after a fatal session error.
    pub fn into_stream(self) -> impl Stream<Item = AcquisitionEvent> + 'a {
        let Self {
            source,
            worklist,
            skip,
            mut expected,
        } = self;

        async_stream::stream! {
            let mut fetched = 0usize;
            for idn in worklist {
                if fetched >= expected {
                    break;
                }
                if skip.contains(&idn) {
                    info!(idn = %idn, "already present; skipping");
                    expected = expected.saturating_sub(1);
                    yield AcquisitionEvent::Skipped { idn };
                    continue;
                }

                let span = info_span!("listing", idn = %idn);
                match source.fetch_listing(&idn).instrument(span).await {
                    Ok(bundle) => {
                        fetched += 1;
                        yield AcquisitionEvent::Fetched { idn, bundle: Box::new(bundle) };
                    }
                    Err(error) => {
                        let fatal = error.is_fatal();
                        warn!(idn = %idn, %error, fatal, "could not fetch listing");
                        yield AcquisitionEvent::Failed { idn, error };
                        if fatal {
                            break;
                        }
                    }
                }
            }
            if fetched < expected {
                warn!(fetched, expected, "fewer listings fetched than expected");
            }
            info!(fetched, "acquisition finished");
        }
    }
}

use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::runtime::{self, Runtime};

use crate::download::{Fetch, HttpFetcher};
use crate::error::Error;
use crate::outcome::{Outcome, ResultStore};
use crate::task::{self, Pool, Task};

/// Reader interface.
pub trait Reader {
    /// Set the number of workers used by [`Reader::read()`].
    ///
    /// It must be set before the first read.
    fn set_concurrency(&mut self, concurrency: NonZeroUsize);

    /// Read every resource concurrently and return their outcomes in input order.
    ///
    /// A failing resource does not fail the whole read: its failure is kept in its own [`Outcome`].
    fn read(&self) -> Result<Vec<Outcome>, Error>;
}

/// Concurrent resource reader.
///
/// Identifiers are fetched by a bounded [`Pool`] of workers, through [`HttpFetcher`] unless another [`Fetch`] implementor
/// is given with [`UrlReader::with_fetcher()`].
///
/// Reads block the calling thread: they are driven by a runtime owned by the reader, built on first use.
/// **Reading from within an asynchronous context is not supported.**
///
/// # Example
/// ```no_run
/// # use reader::{Reader, UrlReader};
/// let reader = UrlReader::new(["http://example.com/", "https://www.rust-lang.org/"]);
///
/// for outcome in reader.read()? {
///     match outcome.into_result() {
///         Ok(body) => println!("{} bytes", body.len()),
///         Err(error) => eprintln!("{error}"),
///     }
/// }
/// # Ok::<_, reader::Error>(())
/// ```
#[derive(Debug)]
pub struct UrlReader<F = HttpFetcher> {
    /// Identifiers to fetch, in output order.
    identifiers: Vec<String>,
    /// Number of workers in a pool.
    concurrency: NonZeroUsize,
    fetcher: Arc<F>,
    runtime: OnceLock<Runtime>,
}

impl UrlReader {
    /// Create a reader fetching `identifiers` over HTTP, with as many workers as there are CPUs.
    pub fn new<I>(identifiers: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            identifiers: identifiers.into_iter().map(Into::into).collect(),
            concurrency: default_concurrency(),
            fetcher: Default::default(),
            runtime: OnceLock::new(),
        }
    }
}

impl<F: Fetch> UrlReader<F> {
    /// Build a new reader fetching the same identifiers with `fetcher`.
    #[inline]
    pub fn with_fetcher<G: Fetch>(self, fetcher: G) -> UrlReader<G> {
        UrlReader {
            identifiers: self.identifiers,
            concurrency: self.concurrency,
            fetcher: Arc::new(fetcher),
            runtime: self.runtime,
        }
    }

    /// Build a new reader with `concurrency` workers.
    #[inline]
    pub fn with_concurrency(self, concurrency: NonZeroUsize) -> Self {
        Self { concurrency, ..self }
    }

    #[inline]
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    #[inline]
    pub fn concurrency(&self) -> NonZeroUsize {
        self.concurrency
    }

    #[inline]
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Read every resource one at a time, in input order.
    ///
    /// Unlike [`Reader::read()`], it stops at the first failing resource and returns its failure,
    /// without fetching the remaining ones.
    pub fn read_sequentially(&self) -> Result<Vec<Bytes>, Error> {
        if self.identifiers.is_empty() {
            return Err(Error::EmptyInput);
        }

        self.runtime()?.block_on(async {
            let mut bodies = Vec::with_capacity(self.identifiers.len());

            for identifier in &self.identifiers {
                tracing::trace!("Fetching `{identifier}`...");

                bodies.push(task::fetch(self.fetcher.as_ref(), identifier).await?);
            }

            Ok::<_, Error>(bodies)
        })
    }

    async fn read_pooled(&self) -> Result<Vec<Outcome>, Error> {
        let tasks: Vec<_> = self
            .identifiers
            .iter()
            .enumerate()
            .map(|(index, identifier)| Task::new(index, identifier.as_str()))
            .collect();

        let store = Arc::new(ResultStore::new(tasks.len()));

        Pool::new(self.concurrency, Arc::clone(&store), tasks)?
            .run(Arc::clone(&self.fetcher))
            .await;

        store.take().ok_or_else(|| Error::Incomplete {
            pending: store.pending(),
        })
    }

    /// Return the reader's runtime, building it on first use.
    fn runtime(&self) -> Result<&Runtime, Error> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }

        tracing::debug!("Building reader runtime");

        let runtime = runtime::Builder::new_multi_thread()
            .thread_name("reader-worker")
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;

        // another thread may have won the race, in which case this runtime is dropped
        Ok(self.runtime.get_or_init(|| runtime))
    }
}

impl<F: Fetch> Reader for UrlReader<F> {
    #[inline]
    fn set_concurrency(&mut self, concurrency: NonZeroUsize) {
        self.concurrency = concurrency;
    }

    fn read(&self) -> Result<Vec<Outcome>, Error> {
        if self.identifiers.is_empty() {
            return Err(Error::EmptyInput);
        }

        tracing::debug!("Reading {} resources with {} workers", self.identifiers.len(), self.concurrency);

        self.runtime()?.block_on(self.read_pooled())
    }
}

/// Number of workers used when none is set.
fn default_concurrency() -> NonZeroUsize {
    NonZeroUsize::new(num_cpus::get()).unwrap_or(NonZeroUsize::MIN)
}

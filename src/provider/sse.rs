//! Server-sent event decoding for streaming providers.
//!
//! [`text_stream`] parses an HTTP byte stream into SSE events with
//! `eventsource-stream` and maps each event's data through a vendor-specific
//! extractor. Multi-line `data:` fields arrive as one payload joined by `\n`.

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};

use super::TextStream;
use crate::error::ProviderError;

/// What a vendor extractor made of one event's data.
#[derive(Debug, PartialEq)]
pub(crate) enum Extracted {
    Text(String),
    Skip,
    Done,
}

/// Vendor-specific mapping from event data to a text chunk.
pub(crate) type Extractor = fn(&str) -> Result<Extracted, ProviderError>;

/// Adapt an HTTP byte stream into a stream of text chunks.
///
/// The stream ends at `Extracted::Done`, at the end of the body, or right
/// after the first error item.
pub(crate) fn text_stream<S>(bytes: S, extract: Extractor) -> TextStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let events = Box::pin(bytes.eventsource());

    let stream = futures::stream::unfold(Some(events), move |events| async move {
        let mut events = events?;
        loop {
            match events.next().await? {
                Ok(event) => match extract(&event.data) {
                    Ok(Extracted::Text(text)) => return Some((Ok(text), Some(events))),
                    Ok(Extracted::Skip) => continue,
                    Ok(Extracted::Done) => return None,
                    Err(err) => return Some((Err(err), None)),
                },
                Err(err) => {
                    tracing::warn!(error = %err, "SSE stream error");
                    return Some((
                        Err(ProviderError::Unavailable(format!(
                            "stream interrupted: {}",
                            err
                        ))),
                        None,
                    ));
                }
            }
        }
    });

    Box::pin(stream)
}

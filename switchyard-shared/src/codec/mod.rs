/// Payload serialization
///
/// Every value that crosses a process boundary (cache entries, job payloads,
/// stream messages) is written as a tagged envelope:
///
/// ```text
/// {"v":1,"t":"my_service::Invoice","d":{...}}
/// ```
///
/// - `v`: envelope version
/// - `t`: Rust type of the encoded value (diagnostic, checked loosely)
/// - `d`: the value as JSON, with dates in RFC 3339 so they round-trip exactly
///
/// # Example
///
/// ```
/// use switchyard_shared::codec::{decode, encode};
/// use chrono::{DateTime, Utc};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let now: DateTime<Utc> = Utc::now();
/// let raw = encode(&now)?;
/// let back: DateTime<Utc> = decode(&raw)?;
/// assert_eq!(now, back);
/// # Ok(())
/// # }
/// ```

pub mod envelope;

// Re-export common types
pub use envelope::{decode, encode, CodecError, Envelope, ENVELOPE_VERSION};

//! URL query string and `application/x-www-form-urlencoded` parser.

use memchr::memchr;
use percent_encoding::percent_decode;
use std::{borrow::Cow, collections::HashMap};
use thiserror::Error;

/// URL query string parser with pluggable collections.
///
/// Splits on `&` and the first `=` of every pair; collections decide whether
/// to keep raw bytes or decode them.
///
/// # Examples
/// ```rust
/// use pico_web::query::{Query, QueryMap};
///
/// // Raw pairs, order preserved, nothing decoded
/// let raw: Vec<(&[u8], &[u8])> = Query::parse(b"name=john%20doe&age=25&city", 10).unwrap();
/// assert_eq!(raw.len(), 3);
/// assert!(raw[0] == (b"name", b"john%20doe"));
///
/// // Decoded map, last value wins
/// let map: QueryMap = Query::parse(b"name=john+doe&tag=a&tag=b", 10).unwrap();
/// assert_eq!(map.get("name"), Some("john doe"));
/// assert_eq!(map.get("tag"), Some("b"));
///
/// // Handle limits
/// let result = Query::parse::<Vec<(&[u8], &[u8])>>(b"a=1&b=2", 1);
/// assert!(result.is_err()); // Exceeds limit of 1 parameter
/// ```
/// All possible formats:
/// ```rust
/// use pico_web::query::Query;
///
/// let query = b"debug&name=&=Qwe&key=sda&&";
/// let vec_params: Vec<(&[u8], &[u8])> = Query::parse(query, 10).unwrap();
///
/// assert_eq!(vec_params.len(), 5);
/// assert!(vec_params[0] == (b"debug", b""));
/// assert!(vec_params[1] == (b"name", b""));
/// assert!(vec_params[2] == (b"", b"Qwe"));
/// assert!(vec_params[3] == (b"key", b"sda"));
/// assert!(vec_params[4] == (b"", b""));
/// ```
#[derive(Debug)]
pub struct Query;

impl Query {
    /// Parses a query string into a new collection.
    ///
    /// # Arguments
    /// - `query`: Raw bytes of the query string
    ///   (handles optional leading `?` automatically, so `?a=1` and `a=1` are equivalent)
    /// - `limit`: Maximum number of parameters to parse
    ///
    /// An empty query (or a lone `?`) yields an empty collection.
    #[inline(always)]
    pub fn parse<'a, C: QueryCollector<'a>>(query: &'a [u8], limit: usize) -> Result<C, Error> {
        let mut result = C::with_capacity(limit.min(16));
        Self::parse_into(&mut result, query, limit)?;
        Ok(result)
    }

    /// Parses a query string into an existing collection.
    ///
    /// Parameters are appended; the limit counts everything already in
    /// the collection.
    ///
    /// # Examples
    /// ```
    /// use pico_web::query::Query;
    ///
    /// let mut collector = Vec::new();
    ///
    /// Query::parse_into(&mut collector, b"a=1&b=2", 10).unwrap();
    /// Query::parse_into(&mut collector, b"c=3&d=4", 10).unwrap();
    /// assert_eq!(collector.len(), 4); // parameters are appended
    ///
    /// let mut collector = Vec::new();
    /// let result = Query::parse_into(&mut collector, b"a=1&b=2&c=3", 2);
    /// assert!(result.is_err()); // limit exceeded after 2 parameters
    /// ```
    #[inline]
    pub fn parse_into<'a, C: QueryCollector<'a>>(
        result: &mut C,
        query: &'a [u8],
        limit: usize,
    ) -> Result<(), Error> {
        let data = match query.first() {
            Some(b'?') => &query[1..],
            _ => query,
        };

        let mut added = 0;
        let mut start = 0;
        while start < data.len() {
            if added >= limit {
                return Err(Error::OverLimit(limit));
            }

            // Find next '&' or end of string
            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());

            // Find '=' within current parameter segment
            let index = memchr(b'=', &data[start..end]).unwrap_or(end - start);
            let split_index = start + index;

            let key = &data[start..split_index];
            let value = match split_index < end {
                true => &data[split_index + 1..end], // Has value after '='
                false => b"",                        // No value (key only)
            };

            result.add_param(key, value)?;
            added += 1;
            start = end + 1;
        }

        Ok(())
    }
}

/// A trait for types that can collect parsed query parameters.
///
/// # Lifetime
/// - `'a`: The lifetime of the input query string bytes
///
/// # Examples
/// ```rust
/// use pico_web::query::{Error, QueryCollector};
///
/// struct KeysOnly(Vec<String>);
///
/// impl<'a> QueryCollector<'a> for KeysOnly {
///     fn add_param(&mut self, key: &'a [u8], _: &'a [u8]) -> Result<(), Error> {
///         self.0.push(String::from_utf8_lossy(key).into_owned());
///         Ok(())
///     }
///
///     fn with_capacity(capacity: usize) -> Self {
///         KeysOnly(Vec::with_capacity(capacity))
///     }
/// }
/// ```
pub trait QueryCollector<'a>
where
    Self: Sized,
{
    /// Adds a parsed parameter to the collection.
    ///
    /// # Arguments
    /// - `key`: The raw parameter name (may be empty)
    /// - `value`: The raw parameter value (empty if no `=` was present)
    fn add_param(&mut self, key: &'a [u8], value: &'a [u8]) -> Result<(), Error>;

    /// Creates a new collection with the specified capacity.
    fn with_capacity(capacity: usize) -> Self;
}

// Raw pairs - preserves parameter order, no decoding
impl<'a> QueryCollector<'a> for Vec<(&'a [u8], &'a [u8])> {
    #[inline(always)]
    fn add_param(&mut self, key: &'a [u8], value: &'a [u8]) -> Result<(), Error> {
        self.push((key, value));
        Ok(())
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }
}

/// Decoded parameters, last value wins on duplicate keys.
///
/// Keys and values are percent-decoded and `+` is read as a space.
/// Used for [`Request::query`](crate::Request::query) and
/// [`Request::form`](crate::Request::form).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMap(HashMap<String, String>);

impl QueryMap {
    /// Returns the decoded value for `key`.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether `key` was present, with or without a value.
    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of distinct keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the query was empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over decoded `(key, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<'a> QueryCollector<'a> for QueryMap {
    #[inline]
    fn add_param(&mut self, key: &'a [u8], value: &'a [u8]) -> Result<(), Error> {
        self.0.insert(decode_form(key)?, decode_form(value)?);
        Ok(())
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        QueryMap(HashMap::with_capacity(capacity))
    }
}

fn decode_form(src: &[u8]) -> Result<String, Error> {
    let plus_free: Cow<'_, [u8]> = match memchr(b'+', src) {
        Some(_) => Cow::Owned(
            src.iter()
                .map(|&b| if b == b'+' { b' ' } else { b })
                .collect(),
        ),
        None => Cow::Borrowed(src),
    };

    percent_decode(&plus_free)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|_| Error::InvalidEncoding)
}

/// Error types that can occur during query parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The number of parameters exceeded the specified limit.
    ///
    /// # Fields
    /// - `0`: The maximum allowed number of parameters
    #[error("query parameter limit exceeded: limit={0}")]
    OverLimit(usize),

    /// A decoded key or value is not valid UTF-8.
    #[error("query parameter is not valid UTF-8 after decoding")]
    InvalidEncoding,
}

impl From<Error> for crate::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::OverLimit(max) => crate::Error::limit(crate::Limit::QueryParts, max),
            Error::InvalidEncoding => crate::Error::malformed("query is not valid UTF-8"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    #[test]
    fn basic() {
        let cases = ["a=1&b=2", "?a=1&b=2"];

        for line in cases {
            let params: Vec<(&[u8], &[u8])> = Query::parse(line.as_bytes(), 8).unwrap();

            assert_eq!(params.len(), 2);
            assert_eq!(str_2(params[0]), ("a", "1"));
            assert_eq!(str_2(params[1]), ("b", "2"));
        }
    }

    #[test]
    fn full() {
        let line = b"flag&empty=&=val&&key=value";
        let params: Vec<(&[u8], &[u8])> = Query::parse(line, 10).unwrap();

        assert_eq!(params.len(), 5);
        assert_eq!(str_2(params[0]), ("flag", ""));
        assert_eq!(str_2(params[1]), ("empty", ""));
        assert_eq!(str_2(params[2]), ("", "val"));
        assert_eq!(str_2(params[3]), ("", ""));
        assert_eq!(str_2(params[4]), ("key", "value"));
    }

    #[test]
    fn decoded_map() {
        #[rustfmt::skip]
        let cases = [
            ("q=hello+world",        "q", Some("hello world")),
            ("q=caf%C3%A9",          "q", Some("café")),
            ("q=a%2Bb",              "q", Some("a+b")),
            ("q=1&q=2&q=3",          "q", Some("3")),
            ("flag",                 "flag", Some("")),
            ("%6Bey=v",              "key", Some("v")),
            ("q=1",                  "x", None),
        ];

        for (line, key, expected) in cases {
            let map: QueryMap = Query::parse(line.as_bytes(), 8).unwrap();
            assert_eq!(map.get(key), expected, "{line}");
        }
    }

    #[test]
    fn empty_is_ok() {
        for line in ["", "?"] {
            let map: QueryMap = Query::parse(line.as_bytes(), 8).unwrap();
            assert!(map.is_empty());
        }
    }

    #[test]
    fn limit_error() {
        assert_eq!(
            Query::parse::<Vec<(&[u8], &[u8])>>(b"a&a", 1),
            Err(Error::OverLimit(1))
        );
        assert!(matches!(
            crate::Error::from(Error::OverLimit(1)),
            crate::Error::LimitExceeded { limit: crate::Limit::QueryParts, max: 1 }
        ));
    }

    #[test]
    fn invalid_utf8() {
        assert_eq!(
            Query::parse::<QueryMap>(b"q=%FF", 8),
            Err(Error::InvalidEncoding)
        );
    }
}

use crate::{server::server_impl::DynHandler, Error, Method};
use percent_encoding::percent_decode_str;
use std::{borrow::Cow, fmt};
use tracing::debug;

/// Route table, read-only once the server starts.
///
/// # Patterns
/// ```text
/// /about              literal segments
/// /users/{id}         `{name}` matches one segment
/// /files/{*rest}      `{*name}` (or `*`) matches the remaining segments, last only
/// ```
///
/// # Resolution order
/// Among the patterns matching a path:
/// 1. fully literal patterns
/// 2. longer literal prefix
/// 3. patterns without a wildcard
/// 4. registration order
///
/// A route for the exact method beats the GET route serving a HEAD request
/// only when both are equally specific.
#[derive(Default)]
pub(crate) struct Router {
    routes: Vec<Route>,
}

struct Route {
    method: Method,
    pattern: Pattern,
    handler: Box<dyn DynHandler>,
}

pub(crate) enum Resolution<'a> {
    Handler {
        handler: &'a dyn DynHandler,
        pattern: &'a str,
        params: Vec<(String, String)>,
    },
    /// OPTIONS for a path without an explicit OPTIONS route.
    Options { allowed: Vec<Method> },
}

impl Router {
    pub(crate) fn register(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Box<dyn DynHandler>,
    ) -> Result<(), Error> {
        let pattern = Pattern::parse(pattern)?;

        let conflict = self
            .routes
            .iter()
            .any(|route| route.method == method && route.pattern.same_shape(&pattern));
        if conflict {
            return Err(Error::RouteConflict {
                method,
                pattern: pattern.source,
            });
        }

        debug!(%method, pattern = %pattern.source, "Route registered");
        self.routes.push(Route {
            method,
            pattern,
            handler,
        });
        Ok(())
    }

    /// Finds the handler for `raw_path`, the undecoded request path.
    ///
    /// # Errors
    /// - [`Error::NotFound`] when no pattern matches the path
    /// - [`Error::MethodNotAllowed`] when patterns match, but not for `method`
    pub(crate) fn resolve(&self, method: Method, raw_path: &str) -> Result<Resolution<'_>, Error> {
        let segments: Vec<&str> = raw_path
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();

        let mut best: Option<(&Route, (Rank, bool))> = None;
        let mut matched = [false; Method::ALL.len()];

        for route in &self.routes {
            if !route.pattern.matches(&segments) {
                continue;
            }
            matched[method_index(route.method)] = true;

            let exact = route.method == method;
            if !exact && !(method == Method::Head && route.method == Method::Get) {
                continue;
            }

            let key = (route.pattern.rank(), exact);
            if best.as_ref().map_or(true, |(_, best_key)| key > *best_key) {
                best = Some((route, key));
            }
        }

        if let Some((route, _)) = best {
            return Ok(Resolution::Handler {
                handler: route.handler.as_ref(),
                pattern: &route.pattern.source,
                params: route.pattern.capture(&segments),
            });
        }

        if !matched.contains(&true) {
            return Err(Error::NotFound);
        }

        let get = method_index(Method::Get);
        matched[method_index(Method::Head)] |= matched[get];
        matched[method_index(Method::Options)] = true;
        let allowed = Method::ALL
            .into_iter()
            .filter(|m| matched[method_index(*m)])
            .collect();

        match method {
            Method::Options => Ok(Resolution::Options { allowed }),
            _ => Err(Error::MethodNotAllowed { allowed }),
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|r| (r.method, &r.pattern.source)))
            .finish()
    }
}

#[inline]
fn method_index(method: Method) -> usize {
    Method::ALL.iter().position(|m| *m == method).unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
    literal: bool,
    prefix: usize,
    bounded: bool,
}

#[derive(Debug)]
struct Pattern {
    source: String,
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(source: &str) -> Result<Self, Error> {
        if !source.starts_with('/') {
            return Err(Error::invalid_pattern(source, "must start with '/'"));
        }

        let parts: Vec<&str> = source.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();

            let segment = match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                _ if *part == "*" => Segment::Wildcard("*".to_owned()),
                Some(inner) => match inner.strip_prefix('*') {
                    Some(name) => Segment::Wildcard(name.to_owned()),
                    None => Segment::Param(inner.to_owned()),
                },
                None if part.contains(|c: char| c == '{' || c == '}') => {
                    return Err(Error::invalid_pattern(source, "parameters must span a whole segment"));
                }
                None => Segment::Literal((*part).to_owned()),
            };

            match &segment {
                Segment::Wildcard(_) if !last => {
                    return Err(Error::invalid_pattern(source, "wildcard must be the last segment"));
                }
                Segment::Param(name) | Segment::Wildcard(name) if name.is_empty() => {
                    return Err(Error::invalid_pattern(source, "empty parameter name"));
                }
                Segment::Param(name) | Segment::Wildcard(name)
                    if name != "*" && name.contains(|c: char| matches!(c, '{' | '}' | '*')) =>
                {
                    return Err(Error::invalid_pattern(source, "invalid parameter name"));
                }
                Segment::Param(name) | Segment::Wildcard(name)
                    if segments.iter().any(|s| matches!(s, Segment::Param(n) | Segment::Wildcard(n) if n == name)) =>
                {
                    return Err(Error::invalid_pattern(source, "duplicate parameter name"));
                }
                _ => {}
            }
            segments.push(segment);
        }

        Ok(Self {
            source: source.to_owned(),
            segments,
        })
    }

    fn wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wildcard(_)))
    }

    fn same_shape(&self, other: &Pattern) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|pair| match pair {
                    (Segment::Literal(a), Segment::Literal(b)) => a == b,
                    (Segment::Param(_), Segment::Param(_)) => true,
                    (Segment::Wildcard(_), Segment::Wildcard(_)) => true,
                    _ => false,
                })
    }

    fn rank(&self) -> Rank {
        Rank {
            literal: self.segments.iter().all(|s| matches!(s, Segment::Literal(_))),
            prefix: self
                .segments
                .iter()
                .take_while(|s| matches!(s, Segment::Literal(_)))
                .count(),
            bounded: !self.wildcard(),
        }
    }

    fn matches(&self, path: &[&str]) -> bool {
        let fixed = match self.wildcard() {
            true => self.segments.len() - 1,
            false => self.segments.len(),
        };
        let length_ok = match self.wildcard() {
            true => path.len() >= fixed,
            false => path.len() == fixed,
        };

        length_ok
            && self.segments[..fixed]
                .iter()
                .zip(path)
                .all(|(segment, raw)| match segment {
                    Segment::Literal(literal) => decode(raw) == literal.as_str(),
                    _ => true,
                })
    }

    fn capture(&self, path: &[&str]) -> Vec<(String, String)> {
        let mut params = Vec::new();
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Param(name) => params.push((name.clone(), decode(path[i]).into_owned())),
                Segment::Wildcard(name) => {
                    let rest: Vec<Cow<'_, str>> = path[i..].iter().map(|raw| decode(raw)).collect();
                    params.push((name.clone(), rest.join("/")));
                }
                Segment::Literal(_) => {}
            }
        }
        params
    }
}

#[inline]
fn decode(raw: &str) -> Cow<'_, str> {
    percent_decode_str(raw).decode_utf8_lossy()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_fn;

    fn router(routes: &[(Method, &str)]) -> Router {
        let mut router = Router::default();
        for (method, pattern) in routes {
            router
                .register(*method, pattern, Box::new(handler_fn(|_, _| ())))
                .unwrap();
        }
        router
    }

    fn matched(router: &Router, method: Method, path: &str) -> Result<(String, Vec<(String, String)>), Error> {
        match router.resolve(method, path)? {
            Resolution::Handler { pattern, params, .. } => Ok((pattern.to_owned(), params)),
            Resolution::Options { allowed } => Ok((format!("OPTIONS {allowed:?}"), Vec::new())),
        }
    }

    #[test]
    fn invalid_patterns() {
        #[rustfmt::skip]
        let cases = [
            "users",
            "/files/{*rest}/more",
            "/files/*/more",
            "/users/{}",
            "/users/{*}",
            "/users/id{x}",
            "/users/{id}/{id}",
            "/users/{a{b}}",
        ];

        for pattern in cases {
            let err = Pattern::parse(pattern).unwrap_err();
            assert!(matches!(err, Error::InvalidPattern { .. }), "{pattern}");
        }
    }

    #[test]
    fn conflicts() {
        let mut router = router(&[(Method::Get, "/users/{id}"), (Method::Get, "/static/{*path}")]);

        #[rustfmt::skip]
        let cases = [
            (Method::Get,  "/users/{name}",   true),
            (Method::Get,  "/users/{id}/",    true),
            (Method::Post, "/users/{id}",     false),
            (Method::Get,  "/users/me",       false),
            (Method::Get,  "/static/*",       true),
            (Method::Get,  "/static",         false),
        ];

        for (method, pattern, conflict) in cases {
            let result = router.register(method, pattern, Box::new(handler_fn(|_, _| ())));
            assert_eq!(matches!(result, Err(Error::RouteConflict { .. })), conflict, "{pattern}");
        }
    }

    #[test]
    fn params_are_decoded() {
        let router = router(&[
            (Method::Get, "/users/{id}/posts/{post}"),
            (Method::Get, "/files/{*path}"),
            (Method::Get, "/café"),
        ]);

        #[rustfmt::skip]
        let cases: [(&str, &str, &[(&str, &str)]); 5] = [
            ("/users/42/posts/7",       "/users/{id}/posts/{post}", &[("id", "42"), ("post", "7")]),
            ("/users/a%20b/posts/x%2Fy", "/users/{id}/posts/{post}", &[("id", "a b"), ("post", "x/y")]),
            ("/files/css/site.css",     "/files/{*path}",           &[("path", "css/site.css")]),
            ("/files",                  "/files/{*path}",           &[("path", "")]),
            ("/caf%C3%A9",              "/café",                    &[]),
        ];

        for (path, pattern, params) in cases {
            let (found, captured) = matched(&router, Method::Get, path).unwrap();
            assert_eq!(found, pattern, "{path}");

            let captured: Vec<(&str, &str)> =
                captured.iter().map(|(n, v)| (n.as_str(), v.as_str())).collect();
            assert_eq!(captured, params, "{path}");
        }
    }

    #[test]
    fn specificity() {
        #[rustfmt::skip]
        let cases: [(&[&str], &str, &str); 6] = [
            (&["/a/{x}", "/a/b"],           "/a/b",     "/a/b"),
            (&["/a/b", "/a/{x}"],           "/a/b",     "/a/b"),
            (&["/a/{x}", "/a/b"],           "/a/c",     "/a/{x}"),
            (&["/{*all}", "/a/{x}"],        "/a/c",     "/a/{x}"),
            (&["/a/{x}/c", "/a/{y}/{z}"],   "/a/b/c",   "/a/{x}/c"),
            (&["/a/{y}/{z}", "/a/{x}/c"],   "/a/b/c",   "/a/{y}/{z}"),
        ];

        for (patterns, path, expected) in cases {
            let routes: Vec<_> = patterns.iter().map(|p| (Method::Get, *p)).collect();
            let router = router(&routes);

            for _ in 0..3 {
                let (found, _) = matched(&router, Method::Get, path).unwrap();
                assert_eq!(found, expected, "{patterns:?} {path}");
            }
        }
    }

    #[test]
    fn not_found_vs_not_allowed() {
        let router = router(&[(Method::Get, "/hello"), (Method::Delete, "/hello")]);

        assert!(matches!(matched(&router, Method::Get, "/nope"), Err(Error::NotFound)));

        match matched(&router, Method::Post, "/hello") {
            Err(Error::MethodNotAllowed { allowed }) => assert_eq!(
                allowed,
                [Method::Get, Method::Delete, Method::Head, Method::Options]
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn implicit_head_and_options() {
        let router = router(&[(Method::Get, "/hello"), (Method::Options, "/custom")]);

        let (found, _) = matched(&router, Method::Head, "/hello").unwrap();
        assert_eq!(found, "/hello");

        match router.resolve(Method::Options, "/hello").unwrap() {
            Resolution::Options { allowed } => {
                assert_eq!(allowed, [Method::Get, Method::Head, Method::Options])
            }
            Resolution::Handler { .. } => panic!("expected automatic OPTIONS"),
        }

        let (found, _) = matched(&router, Method::Options, "/custom").unwrap();
        assert_eq!(found, "/custom");
    }

    #[test]
    fn root_and_normalization() {
        let router = router(&[(Method::Get, "/"), (Method::Get, "/a/b")]);

        #[rustfmt::skip]
        let cases = [
            ("/",         "/"),
            ("//a///b/",  "/a/b"),
            ("/a/./b",    "/a/b"),
        ];

        for (path, expected) in cases {
            assert_eq!(matched(&router, Method::Get, path).unwrap().0, expected, "{path}");
        }
    }
}

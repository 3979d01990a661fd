//! URL normalization and wildcard pattern matching.
//!
//! `normalize` makes a request URL order-independent in its query portion so
//! it can serve as a stable index key. `match_pattern` implements the `*`
//! wildcard used by wildcard rules: greedy in the path, bounded by `&` in the
//! query.

/// Canonicalize a URL: sort query parameters lexicographically by key, render
/// empty values as a bare key, join repeated values without a separator, and
/// keep any fragment. URLs without a query are returned unchanged.
///
/// Idempotent: `normalize(normalize(u)) == normalize(u)`.
pub fn normalize(url: &str) -> String {
    let (without_fragment, fragment) = match url.find('#') {
        Some(pos) => (&url[..pos], Some(&url[pos + 1..])),
        None => (url, None),
    };

    let Some(qpos) = without_fragment.find('?') else {
        return url.to_string();
    };

    let path = &without_fragment[..qpos];
    let query = &without_fragment[qpos + 1..];

    let mut params: Vec<(String, String)> = Vec::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if key.is_empty() {
            continue;
        }
        match params.iter_mut().find(|(k, _)| k == key) {
            // Repeated values are joined without a separator so the key is
            // stable under reordering.
            Some((_, joined)) => joined.push_str(value),
            None => params.push((key.to_string(), value.to_string())),
        }
    }

    if params.is_empty() {
        let mut result = path.to_string();
        if let Some(f) = fragment {
            result.push('#');
            result.push_str(f);
        }
        return result;
    }

    params.sort_by(|a, b| a.0.cmp(&b.0));

    let mut result = String::with_capacity(url.len());
    result.push_str(path);
    result.push('?');
    for (i, (key, value)) in params.iter().enumerate() {
        if i > 0 {
            result.push('&');
        }
        result.push_str(key);
        if !value.is_empty() {
            result.push('=');
            result.push_str(value);
        }
    }
    if let Some(f) = fragment {
        result.push('#');
        result.push_str(f);
    }
    result
}

/// True if the concrete `url` satisfies `pattern`. `*` matches a run of
/// characters of any length: unrestricted in the path portion, never crossing
/// a `&` in the query portion. A pattern without a query part ignores the
/// URL's query entirely.
pub fn match_pattern(pattern: &str, url: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if pattern == url {
        return true;
    }

    let (p_path, p_query) = split_query(pattern);
    let (u_path, u_query) = split_query(url);

    match p_query {
        None => glob_match(p_path, u_path, None),
        Some(pq) => {
            glob_match(p_path, u_path, None) && glob_match(pq, u_query.unwrap_or(""), Some(b'&'))
        }
    }
}

/// True if either pattern matches the other. Used to reject wildcard rules
/// whose URLs would intersect.
pub fn equal_patterns(a: &str, b: &str) -> bool {
    match_pattern(a, b) || match_pattern(b, a)
}

fn split_query(s: &str) -> (&str, Option<&str>) {
    match s.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (s, None),
    }
}

/// Glob match where `*` is the only metacharacter. When `boundary` is set,
/// `*` may not consume that byte (query values are independent between `&`).
fn glob_match(pattern: &str, text: &str, boundary: Option<u8>) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let mut pi = 0;
    let mut ti = 0;
    // Last `*` seen: pattern position after it and the text position it
    // restarts from when backtracking.
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi + 1, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star_pi, star_ti)) = star {
            if boundary == Some(t[star_ti]) {
                return false;
            }
            pi = star_pi;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

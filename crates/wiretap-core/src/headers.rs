use crate::error::HeaderError;

/// Multi-valued HTTP header store with case-normalised keys.
///
/// Keys are normalised to this project's convention (first character
/// uppercased, every following letter lowercased), not RFC canonical form:
/// `content-length` becomes `Content-length`. Iteration follows key
/// insertion order. A bag built from a parsed request is frozen; all
/// mutators then fail with [`HeaderError::ReadOnly`].
#[derive(Debug, Clone, Default)]
pub struct HeaderBag {
    entries: Vec<(String, Vec<String>)>,
    read_only: bool,
}

/// Normalise a header name. Empty or blank names are rejected.
fn normalize(name: &str) -> Result<String, HeaderError> {
    if name.trim().is_empty() {
        return Err(HeaderError::EmptyName);
    }
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        out.extend(first.to_uppercase());
    }
    for c in chars {
        out.extend(c.to_lowercase());
    }
    Ok(out)
}

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any existing values for `name` with the single `value`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<(), HeaderError> {
        if self.read_only {
            return Err(HeaderError::ReadOnly);
        }
        let key = normalize(name)?;
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => {
                values.clear();
                values.push(value);
            }
            None => self.entries.push((key, vec![value])),
        }
        Ok(())
    }

    /// Append `value` to the list for `name`.
    pub fn add(&mut self, name: &str, value: impl Into<String>) -> Result<(), HeaderError> {
        if self.read_only {
            return Err(HeaderError::ReadOnly);
        }
        let key = normalize(name)?;
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key, vec![value])),
        }
        Ok(())
    }

    /// First value for `name`, if any.
    pub fn first(&self, name: &str) -> Option<&str> {
        let key = normalize(name).ok()?;
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    /// All values for `name`, in insertion order.
    pub fn all(&self, name: &str) -> &[String] {
        normalize(name)
            .ok()
            .and_then(|key| self.entries.iter().find(|(k, _)| *k == key))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.first(name).is_some()
    }

    /// Flip the bag to read-only. There is no way back.
    pub fn freeze(&mut self) {
        self.read_only = true;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(normalised name, values)` in key insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(k, values)| (k.as_str(), values.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_first_upper_rest_lower() {
        let mut bag = HeaderBag::new();
        bag.set("content-LENGTH", "5").unwrap();
        assert_eq!(bag.first("Content-length"), Some("5"));
        assert_eq!(bag.iter().next().unwrap().0, "Content-length");
    }

    #[test]
    fn test_digits_and_separators_pass_through() {
        let mut bag = HeaderBag::new();
        bag.set("X-Header-2", "v").unwrap();
        assert_eq!(bag.iter().next().unwrap().0, "X-header-2");
    }

    #[test]
    fn test_empty_and_blank_names_rejected() {
        let mut bag = HeaderBag::new();
        assert_eq!(bag.set("", "v"), Err(HeaderError::EmptyName));
        assert_eq!(bag.add("   ", "v"), Err(HeaderError::EmptyName));
        assert_eq!(bag.first(""), None);
    }

    #[test]
    fn test_set_replaces_add_appends() {
        let mut bag = HeaderBag::new();
        bag.add("Accept", "text/html").unwrap();
        bag.add("accept", "text/plain").unwrap();
        assert_eq!(bag.all("Accept"), ["text/html", "text/plain"]);
        bag.set("Accept", "*/*").unwrap();
        assert_eq!(bag.all("Accept"), ["*/*"]);
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let mut bag = HeaderBag::new();
        bag.set("Host", "localhost").unwrap();
        bag.freeze();
        assert_eq!(bag.set("Host", "other"), Err(HeaderError::ReadOnly));
        assert_eq!(bag.add("Host", "other"), Err(HeaderError::ReadOnly));
        assert_eq!(bag.first("Host"), Some("localhost"));
    }

    #[test]
    fn test_iteration_in_insertion_order() {
        let mut bag = HeaderBag::new();
        bag.set("Zebra", "1").unwrap();
        bag.set("Alpha", "2").unwrap();
        bag.add("Zebra", "3").unwrap();
        let keys: Vec<&str> = bag.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["Zebra", "Alpha"]);
    }
}

use std::collections::hash_map::Entry;

use uuid::Uuid;

pub(crate) fn generate_id() -> String {
  Uuid::new_v4().to_string()
}

/// 24-bit hex id identifying a bridge session; clients echo it back so that
/// stale ICE-failure reports can be told apart from current ones.
pub(crate) fn generate_session_id() -> String {
  hex::encode(rand::random::<[u8; 3]>())
}

pub(crate) trait FallibleEntry<'a, V> {
  fn or_try_insert_with<E, F: FnOnce() -> Result<V, E>>(self, default: F) -> Result<&'a mut V, E>;
}

impl<'a, K, V> FallibleEntry<'a, V> for Entry<'a, K, V> {
  fn or_try_insert_with<E, F: FnOnce() -> Result<V, E>>(self, default: F) -> Result<&'a mut V, E> {
    Ok(match self {
      Entry::Occupied(entry) => entry.into_mut(),
      Entry::Vacant(entry) => entry.insert(default()?),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn session_ids_are_24_bit_hex() {
    let id = generate_session_id();
    assert_eq!(id.len(), 6);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
  }
}

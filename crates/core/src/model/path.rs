use std::time::SystemTime;

use crate::status::{Result, Status};

/// One hop of a connection. The segment at `Path::index` binds the identity
/// of the local hop; its token is regenerated on every pass while the id
/// stays stable for the lifetime of the connection at that hop.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PathSegment {
    pub name: String,
    pub id: String,
    pub token: String,
    /// Promise by which this segment must be refreshed.
    pub expires: Option<SystemTime>,
}

/// Ordered record of the hops a connection traverses.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Path {
    pub segments: Vec<PathSegment>,
    pub index: usize,
}

impl Path {
    pub fn current_segment(&self) -> Option<&PathSegment> {
        self.segments.get(self.index)
    }

    pub fn current_segment_mut(&mut self) -> Option<&mut PathSegment> {
        self.segments.get_mut(self.index)
    }

    /// Segment of the hop that called us, if any.
    pub fn prev_segment(&self) -> Option<&PathSegment> {
        self.index.checked_sub(1).and_then(|i| self.segments.get(i))
    }

    /// Segment of the hop we forwarded to, if any.
    pub fn next_segment(&self) -> Option<&PathSegment> {
        self.segments.get(self.index + 1)
    }

    /// Earliest expiration promise across the whole path. `None` when no
    /// segment carries one.
    pub fn min_expires(&self) -> Option<SystemTime> {
        self.segments.iter().filter_map(|s| s.expires).min()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.segments.is_empty() && self.index >= self.segments.len() {
            return Err(Status::invalid_argument(format!(
                "path index {} outside of {} segments",
                self.index,
                self.segments.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn seg(name: &str, expires_in: Option<u64>) -> PathSegment {
        PathSegment {
            name: name.into(),
            id: format!("id-{name}"),
            token: String::new(),
            expires: expires_in.map(|s| SystemTime::now() + Duration::from_secs(s)),
        }
    }

    #[test]
    fn min_expires_skips_unset_segments() {
        let path = Path {
            segments: vec![seg("a", Some(60)), seg("b", None), seg("c", Some(30))],
            index: 0,
        };
        let min = path.min_expires().unwrap();
        assert_eq!(min, path.segments[2].expires.unwrap());
    }

    #[test]
    fn validate_rejects_out_of_range_index() {
        let path = Path {
            segments: vec![seg("a", None)],
            index: 1,
        };
        assert!(matches!(path.validate(), Err(Status::InvalidArgument(_))));
    }
}

//! Named debug rasters for external visualisation.

use crate::frame::Plane;

/// Ordered list of named debug images produced during one processed frame.
///
/// Purely observational; nothing in the pipeline ever reads these back.
#[derive(Clone, Debug, Default)]
pub struct DebugImageList {
    images: Vec<(String, Plane<u8>)>,
}

impl DebugImageList {
    pub fn push(&mut self, name: impl Into<String>, image: Plane<u8>) {
        self.images.push((name.into(), image));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Plane<u8>)> {
        self.images.iter().map(|(n, i)| (n.as_str(), i))
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

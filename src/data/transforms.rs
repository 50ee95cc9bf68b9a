use crate::data::models::Volume;
use crate::error::{Result, VolsegError};

/// Min-max rescale `data` in place to `[minv, maxv]`.
/// A constant array becomes `minv` everywhere.
pub fn rescale_array(data: &mut [f32], minv: f32, maxv: f32) {
    let (min, max) = data
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if data.is_empty() {
        return;
    }
    let range = max - min;
    if range == 0.0 {
        data.iter_mut().for_each(|v| *v = minv);
        return;
    }
    for v in data.iter_mut() {
        *v = (*v - min) / range * (maxv - minv) + minv;
    }
}

/// A per-volume preprocessing step
pub trait Transform: Send + Sync {
    fn apply(&self, volume: Volume) -> Result<Volume>;
}

/// Rescale intensities to `[minv, maxv]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescale {
    pub minv: f32,
    pub maxv: f32,
}

impl Default for Rescale {
    fn default() -> Self {
        Self {
            minv: 0.0,
            maxv: 1.0,
        }
    }
}

impl Transform for Rescale {
    fn apply(&self, mut volume: Volume) -> Result<Volume> {
        if self.minv > self.maxv {
            return Err(VolsegError::invalid(format!(
                "rescale range [{}, {}] is empty",
                self.minv, self.maxv
            )));
        }
        rescale_array(&mut volume.data, self.minv, self.maxv);
        Ok(volume)
    }
}

/// Prepend a unit channel dimension: `[x, y, z]` -> `[1, x, y, z]`
#[derive(Debug, Clone, Copy, Default)]
pub struct AddChannel;

impl Transform for AddChannel {
    fn apply(&self, mut volume: Volume) -> Result<Volume> {
        volume.shape.insert(0, 1);
        Ok(volume)
    }
}

/// Apply transforms in order
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl Transform for Compose {
    fn apply(&self, volume: Volume) -> Result<Volume> {
        self.transforms
            .iter()
            .try_fold(volume, |volume, transform| transform.apply(volume))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_to_unit_range() {
        let volume = Volume::new(vec![-2.0, 0.0, 2.0, 6.0], vec![4]).unwrap();

        let out = Rescale::default().apply(volume).unwrap();

        assert_eq!(out.data, vec![0.0, 0.25, 0.5, 1.0]);
    }

    #[test]
    fn test_rescale_constant_volume() {
        let volume = Volume::new(vec![3.0; 4], vec![2, 2]).unwrap();

        let out = Rescale { minv: -1.0, maxv: 1.0 }.apply(volume).unwrap();

        assert_eq!(out.data, vec![-1.0; 4]);
    }

    #[test]
    fn test_compose_applies_in_order() {
        let volume = Volume::new(vec![0.0, 10.0], vec![2]).unwrap();
        let transform = Compose::new().then(Rescale::default()).then(AddChannel);

        let out = transform.apply(volume).unwrap();

        assert_eq!(transform.len(), 2);
        assert_eq!(out.shape, vec![1, 2]);
        assert_eq!(out.data, vec![0.0, 1.0]);
    }
}

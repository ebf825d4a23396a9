//! Sample-size policy shared by the tiled engine and whole-image decoding.
//!
//! A sample size is a power-of-two downsampling factor. The policy picks the
//! coarsest factor that still looks correct for the requested target size and
//! never upsamples.

use crate::geometry::Size;

/// Tuning knobs for [`calculate_sample_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleSizePolicy {
    /// Compare pixel counts instead of per-dimension sizes, which allows the
    /// result to fall below the target in one dimension.
    pub smaller_size_mode: bool,
    /// Upper bound for either sampled dimension (e.g. a texture size limit).
    pub max_dimension: Option<u32>,
}

impl SampleSizePolicy {
    pub fn calculate(&self, image: Size, target: Size) -> u32 {
        calculate_sample_size(image, target, *self)
    }
}

/// Dimensions of `size` after downsampling by `sample_size` (ceiling division).
pub fn sampled_size(size: Size, sample_size: u32) -> Size {
    let s = sample_size.max(1);
    Size::new(size.width.div_ceil(s), size.height.div_ceil(s))
}

/// Pick the downsampling factor for decoding `image` to be shown at `target`.
pub fn calculate_sample_size(image: Size, target: Size, policy: SampleSizePolicy) -> u32 {
    if image.is_empty() || target.is_empty() {
        return 1;
    }

    let mut sample_size = 1u32;

    let covers = target.width >= image.width && target.height >= image.height;
    if !covers {
        loop {
            let Some(next) = sample_size.checked_mul(2) else {
                break;
            };
            let sampled = sampled_size(image, next);
            let keep_going = if policy.smaller_size_mode {
                sampled_size(image, sample_size).area() > target.area()
            } else {
                sampled.width >= target.width && sampled.height >= target.height
            };
            if !keep_going || sampled.is_empty() {
                break;
            }
            sample_size = next;
        }
    }

    if let Some(max) = policy.max_dimension.filter(|m| *m > 0) {
        loop {
            let sampled = sampled_size(image, sample_size);
            if sampled.width <= max && sampled.height <= max {
                break;
            }
            match sample_size.checked_mul(2) {
                Some(next) => sample_size = next,
                None => break,
            }
        }
    }

    sample_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc(iw: u32, ih: u32, tw: u32, th: u32) -> u32 {
        calculate_sample_size(Size::new(iw, ih), Size::new(tw, th), SampleSizePolicy::default())
    }

    #[test]
    fn test_never_upsample() {
        assert_eq!(calc(800, 600, 1600, 1200), 1);
        assert_eq!(calc(800, 600, 800, 600), 1);
    }

    #[test]
    fn test_halves_until_target_would_be_crossed() {
        // 2000x1500 region shown in 1000x750 screen pixels
        assert_eq!(calc(2000, 1500, 1000, 750), 2);
        assert_eq!(calc(4000, 3000, 1000, 750), 4);
        assert_eq!(calc(4000, 3000, 1001, 750), 2);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(calc(0, 100, 10, 10), 1);
        assert_eq!(calc(100, 100, 0, 10), 1);
    }

    #[test]
    fn test_smaller_size_mode_is_never_finer() {
        let image = Size::new(5000, 1000);
        let target = Size::new(1000, 800);
        let normal = calculate_sample_size(image, target, SampleSizePolicy::default());
        let smaller = calculate_sample_size(
            image,
            target,
            SampleSizePolicy {
                smaller_size_mode: true,
                max_dimension: None,
            },
        );
        assert_eq!(normal, 1);
        assert!(smaller >= normal);
        assert_eq!(smaller, 4);
    }

    #[test]
    fn test_max_dimension_cap() {
        let policy = SampleSizePolicy {
            smaller_size_mode: false,
            max_dimension: Some(4096),
        };
        assert_eq!(policy.calculate(Size::new(10000, 100), Size::new(10000, 100)), 4);
    }

    #[test]
    fn test_sampled_size_rounds_up() {
        assert_eq!(sampled_size(Size::new(101, 99), 2), Size::new(51, 50));
        assert_eq!(sampled_size(Size::new(10, 10), 0), Size::new(10, 10));
    }
}

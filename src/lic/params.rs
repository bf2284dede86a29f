//! Integration parameters and their validation.

use crate::error::{LicError, LicResult};

/// Units the incoming vector field is expressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VectorSpace {
    /// Pixels per unit time; used as-is.
    #[default]
    Screen,
    /// Normalized texture units; scaled by the screen size before
    /// integration.
    Texture,
}

/// Where contrast enhancement runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EnhanceContrast {
    #[default]
    Off,
    /// CE1 and CE2 on the LIC intensity.
    Lic,
    /// Lightness stretch of the combined color image.
    Color,
    Both,
}

impl EnhanceContrast {
    pub fn parse(v: &str) -> Option<Self> {
        match v.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Some(Self::Off),
            "lic" => Some(Self::Lic),
            "color" => Some(Self::Color),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    #[inline]
    pub fn lic(self) -> bool {
        matches!(self, EnhanceContrast::Lic | EnhanceContrast::Both)
    }

    #[inline]
    pub fn color(self) -> bool {
        matches!(self, EnhanceContrast::Color | EnhanceContrast::Both)
    }
}

/// Parameters of one LIC computation.
///
/// Use `LicParams::default()` and the builder methods; call `validate` before
/// any pass runs.
#[derive(Clone, Debug, PartialEq)]
pub struct LicParams {
    /// Integration step in pixels.
    pub step_size: f32,
    /// Steps taken in each direction during the first pass.
    pub step_count: i32,
    pub normalize_vectors: bool,
    /// Two-pass LIC: the edge-enhanced first result is convolved again.
    pub enhanced_lic: bool,
    pub enhance_contrast: EnhanceContrast,
    /// Fractions of the LIC intensity range trimmed by CE2.
    pub low_contrast_factor: f32,
    pub high_contrast_factor: f32,
    /// Number of separable horizontal + vertical blur rounds.
    pub anti_alias: u32,
    /// Fragments whose mask vector magnitude is at most this are masked.
    pub mask_threshold: f32,
    pub vector_space: VectorSpace,
}

impl Default for LicParams {
    fn default() -> Self {
        Self {
            step_size: 1.0,
            step_count: 1,
            normalize_vectors: true,
            enhanced_lic: true,
            enhance_contrast: EnhanceContrast::Off,
            low_contrast_factor: 0.0,
            high_contrast_factor: 0.0,
            anti_alias: 0,
            mask_threshold: 0.0,
            vector_space: VectorSpace::Screen,
        }
    }
}

impl LicParams {
    pub fn step_size(mut self, h: f32) -> Self {
        self.step_size = h;
        self
    }

    pub fn step_count(mut self, n: i32) -> Self {
        self.step_count = n;
        self
    }

    pub fn normalize_vectors(mut self, on: bool) -> Self {
        self.normalize_vectors = on;
        self
    }

    pub fn enhanced_lic(mut self, on: bool) -> Self {
        self.enhanced_lic = on;
        self
    }

    pub fn enhance_contrast(mut self, mode: EnhanceContrast) -> Self {
        self.enhance_contrast = mode;
        self
    }

    pub fn contrast_factors(mut self, low: f32, high: f32) -> Self {
        self.low_contrast_factor = low;
        self.high_contrast_factor = high;
        self
    }

    pub fn anti_alias(mut self, passes: u32) -> Self {
        self.anti_alias = passes;
        self
    }

    pub fn mask_threshold(mut self, t: f32) -> Self {
        self.mask_threshold = t;
        self
    }

    pub fn vector_space(mut self, space: VectorSpace) -> Self {
        self.vector_space = space;
        self
    }

    /// Reject parameter sets no pass can run with.
    pub fn validate(&self) -> LicResult<()> {
        if !self.step_size.is_finite() || self.step_size < 0.0 {
            return Err(LicError::config(format!(
                "step size must be finite and non-negative, got {}",
                self.step_size
            )));
        }
        if self.step_count < 0 {
            return Err(LicError::config(format!(
                "step count must be non-negative, got {}",
                self.step_count
            )));
        }
        check_contrast_factors(self.low_contrast_factor, self.high_contrast_factor)?;
        if !self.mask_threshold.is_finite() || self.mask_threshold < 0.0 {
            return Err(LicError::config(format!(
                "mask threshold must be finite and non-negative, got {}",
                self.mask_threshold
            )));
        }
        Ok(())
    }

    /// Steps per direction in the second, edge-enhanced pass.
    #[inline]
    pub fn second_pass_steps(&self) -> i32 {
        self.step_count / 2
    }

    /// Furthest a streamline can travel from its seed, in multiples of
    /// `step_size * step_count`.
    #[inline]
    pub fn reach_levels(&self) -> f64 {
        if self.enhanced_lic { 1.5 } else { 1.0 }
    }

    /// Extra pixels read by the filter kernels beyond the streamline reach.
    #[inline]
    pub fn kernel_margin(&self) -> i32 {
        let ee = i32::from(self.enhanced_lic);
        ee + 2 * self.anti_alias.min(i32::MAX as u32 / 4) as i32
    }
}

/// Trim fractions must lie in [0, 1] and leave part of the range.
pub(crate) fn check_contrast_factors(low: f32, high: f32) -> LicResult<()> {
    for (name, f) in [("low", low), ("high", high)] {
        if !(0.0..=1.0).contains(&f) {
            return Err(LicError::config(format!(
                "{name} contrast factor must lie in [0, 1], got {f}"
            )));
        }
    }
    if low + high >= 1.0 {
        return Err(LicError::config(
            "contrast factors leave an empty intensity range",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{EnhanceContrast, LicParams};
    use crate::error::LicError;

    #[test]
    fn defaults_validate() {
        assert!(LicParams::default().validate().is_ok());
    }

    #[test]
    fn negative_step_inputs_are_configuration_errors() {
        let err = LicParams::default().step_count(-1).validate().unwrap_err();
        assert!(matches!(err, LicError::Config(_)), "{err}");
        let err = LicParams::default().step_size(-0.5).validate().unwrap_err();
        assert!(matches!(err, LicError::Config(_)), "{err}");
    }

    #[test]
    fn contrast_factors_must_leave_a_range() {
        assert!(LicParams::default().contrast_factors(0.2, 0.3).validate().is_ok());
        assert!(LicParams::default().contrast_factors(0.6, 0.4).validate().is_err());
        assert!(LicParams::default().contrast_factors(-0.1, 0.0).validate().is_err());
    }

    #[test]
    fn contrast_modes_select_their_stages() {
        assert!(!EnhanceContrast::Off.lic() && !EnhanceContrast::Off.color());
        assert!(EnhanceContrast::Lic.lic() && !EnhanceContrast::Lic.color());
        assert!(!EnhanceContrast::Color.lic() && EnhanceContrast::Color.color());
        assert!(EnhanceContrast::Both.lic() && EnhanceContrast::Both.color());
        assert_eq!(EnhanceContrast::parse(" Color "), Some(EnhanceContrast::Color));
        assert_eq!(EnhanceContrast::parse("sometimes"), None);
    }

    #[test]
    fn kernel_margin_tracks_enhancement_and_aa() {
        let p = LicParams::default().enhanced_lic(false);
        assert_eq!(p.kernel_margin(), 0);
        let p = LicParams::default().anti_alias(2);
        assert_eq!(p.kernel_margin(), 5);
    }
}

//! Engine options and their command-line flags.

use std::collections::HashMap;
use std::ffi::OsString;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::JobError;

static LANGUAGE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("language regex must compile"));

/// Page cleanup performed by the engine (via `unpaper`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanMode {
    #[default]
    None,
    /// Clean pages before OCR but keep the original images in the output.
    Clean,
    /// Clean pages before OCR and put the cleaned images in the output.
    CleanFinal,
}

impl FromStr for CleanMode {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(Self::None),
            "clean" => Ok(Self::Clean),
            "clean_final" => Ok(Self::CleanFinal),
            other => Err(JobError::InvalidOptions(format!(
                "unknown clean mode {:?}",
                other
            ))),
        }
    }
}

/// How the engine treats pages that already carry a text layer.
///
/// The engine refuses more than one of these at a time, so they share an enum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextLayerMode {
    /// Fail when a page already has text.
    #[default]
    Default,
    /// Leave pages with text alone and OCR the rest.
    Skip,
    /// Strip the existing OCR layer and OCR again.
    Redo,
    /// Rasterize everything and OCR again, discarding existing text.
    Force,
}

impl FromStr for TextLayerMode {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "default" => Ok(Self::Default),
            "skip" => Ok(Self::Skip),
            "redo" => Ok(Self::Redo),
            "force" => Ok(Self::Force),
            other => Err(JobError::InvalidOptions(format!(
                "unknown text layer mode {:?}",
                other
            ))),
        }
    }
}

/// Options passed through to `ocrmypdf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrOptions {
    pub rotate_pages: bool,
    pub deskew: bool,
    pub clean: CleanMode,
    pub text_layer: TextLayerMode,
    /// 0 is lossless, 3 is the most aggressive.
    pub optimize: u8,
    pub languages: Vec<String>,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            rotate_pages: false,
            deskew: false,
            clean: CleanMode::None,
            text_layer: TextLayerMode::Default,
            optimize: 1,
            languages: Vec::new(),
        }
    }
}

impl OcrOptions {
    /// Build options from submitted form fields.
    ///
    /// Unknown fields are ignored; checkboxes count as set for `on`, `true`,
    /// `yes` or `1`.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, JobError> {
        let field = |name: &str| fields.get(name).map(|v| v.trim()).unwrap_or("");

        let optimize = match field("optimize") {
            "" => 1,
            value => value.parse::<u8>().map_err(|_| {
                JobError::InvalidOptions(format!("optimize must be 0-3, got {:?}", value))
            })?,
        };

        let languages = field("language")
            .split(['+', ',', ' '])
            .filter(|code| !code.is_empty())
            .map(str::to_string)
            .collect();

        let options = Self {
            rotate_pages: is_checked(field("rotate_pages")),
            deskew: is_checked(field("deskew")),
            clean: field("clean").parse()?,
            text_layer: field("text_layer").parse()?,
            optimize,
            languages,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.optimize > 3 {
            return Err(JobError::InvalidOptions(format!(
                "optimize must be 0-3, got {}",
                self.optimize
            )));
        }
        if let Some(bad) = self
            .languages
            .iter()
            .find(|code| !LANGUAGE_CODE.is_match(code))
        {
            return Err(JobError::InvalidOptions(format!(
                "invalid language code {:?}",
                bad
            )));
        }
        Ok(())
    }

    /// The engine flags for these options, in a stable order.
    pub fn to_cli_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if self.rotate_pages {
            args.push("--rotate-pages".into());
        }
        if self.deskew {
            args.push("--deskew".into());
        }
        match self.clean {
            CleanMode::None => {}
            CleanMode::Clean => args.push("--clean".into()),
            CleanMode::CleanFinal => args.push("--clean-final".into()),
        }
        match self.text_layer {
            TextLayerMode::Default => {}
            TextLayerMode::Skip => args.push("--skip-text".into()),
            TextLayerMode::Redo => args.push("--redo-ocr".into()),
            TextLayerMode::Force => args.push("--force-ocr".into()),
        }
        if !self.languages.is_empty() {
            args.push("--language".into());
            args.push(self.languages.join("+").into());
        }
        args.push("--optimize".into());
        args.push(self.optimize.to_string().into());
        args
    }
}

/// Output format for extracted page images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            other => Err(JobError::InvalidOptions(format!(
                "unknown image format {:?}",
                other
            ))),
        }
    }
}

/// Options for rasterizing PDF pages into images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageOptions {
    pub dpi: u32,
    pub format: ImageFormat,
    /// JPEG quality, ignored for PNG.
    pub quality: u8,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            dpi: 200,
            format: ImageFormat::Jpeg,
            quality: 95,
        }
    }
}

impl ImageOptions {
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, JobError> {
        let defaults = Self::default();
        let field = |name: &str| fields.get(name).map(|v| v.trim()).unwrap_or("");

        let dpi = match field("dpi") {
            "" => defaults.dpi,
            value => value.parse().map_err(|_| {
                JobError::InvalidOptions(format!("dpi must be a number, got {:?}", value))
            })?,
        };
        let quality = match field("quality") {
            "" => defaults.quality,
            value => value.parse().map_err(|_| {
                JobError::InvalidOptions(format!("quality must be 1-100, got {:?}", value))
            })?,
        };

        let options = Self {
            dpi,
            format: field("format").parse()?,
            quality,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if !(72..=1200).contains(&self.dpi) {
            return Err(JobError::InvalidOptions(format!(
                "dpi must be between 72 and 1200, got {}",
                self.dpi
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(JobError::InvalidOptions(format!(
                "quality must be between 1 and 100, got {}",
                self.quality
            )));
        }
        Ok(())
    }

    /// `pdftoppm` flags for these options.
    pub fn to_cli_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-r".into(), self.dpi.to_string().into()];
        match self.format {
            ImageFormat::Jpeg => {
                args.push("-jpeg".into());
                args.push("-jpegopt".into());
                args.push(format!("quality={}", self.quality).into());
            }
            ImageFormat::Png => args.push("-png".into()),
        }
        args
    }
}

fn is_checked(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "on" | "true" | "yes" | "1"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn args(options: &OcrOptions) -> Vec<String> {
        options
            .to_cli_args()
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect()
    }

    #[test]
    fn test_default_flags() {
        assert_eq!(args(&OcrOptions::default()), vec!["--optimize", "1"]);
    }

    #[test]
    fn test_all_flags() {
        let options = OcrOptions {
            rotate_pages: true,
            deskew: true,
            clean: CleanMode::CleanFinal,
            text_layer: TextLayerMode::Redo,
            optimize: 3,
            languages: vec!["eng".into(), "deu".into()],
        };
        assert_eq!(
            args(&options),
            vec![
                "--rotate-pages",
                "--deskew",
                "--clean-final",
                "--redo-ocr",
                "--language",
                "eng+deu",
                "--optimize",
                "3"
            ]
        );
    }

    #[test]
    fn test_from_form_fields() {
        let options = OcrOptions::from_fields(&fields(&[
            ("rotate_pages", "on"),
            ("deskew", "off"),
            ("clean", "clean"),
            ("text_layer", "force"),
            ("optimize", "0"),
            ("language", "eng, chi_sim"),
        ]))
        .unwrap();

        assert!(options.rotate_pages);
        assert!(!options.deskew);
        assert_eq!(options.clean, CleanMode::Clean);
        assert_eq!(options.text_layer, TextLayerMode::Force);
        assert_eq!(options.optimize, 0);
        assert_eq!(options.languages, vec!["eng", "chi_sim"]);
    }

    #[test]
    fn test_empty_fields_give_defaults() {
        assert_eq!(
            OcrOptions::from_fields(&HashMap::new()).unwrap(),
            OcrOptions::default()
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        for pairs in [
            [("optimize", "4")],
            [("optimize", "max")],
            [("clean", "scrub")],
            [("text_layer", "overwrite")],
            [("language", "--output-type")],
        ] {
            let err = OcrOptions::from_fields(&fields(&pairs)).unwrap_err();
            assert!(matches!(err, JobError::InvalidOptions(_)), "{:?}", pairs);
        }
    }

    #[test]
    fn test_image_options() {
        let options = ImageOptions::from_fields(&fields(&[
            ("dpi", "300"),
            ("format", "PNG"),
        ]))
        .unwrap();
        assert_eq!(options.dpi, 300);
        assert_eq!(options.format, ImageFormat::Png);
        assert_eq!(options.quality, 95);

        let jpeg: Vec<String> = ImageOptions::default()
            .to_cli_args()
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(jpeg, vec!["-r", "200", "-jpeg", "-jpegopt", "quality=95"]);

        assert!(ImageOptions::from_fields(&fields(&[("dpi", "50")])).is_err());
        assert!(ImageOptions::from_fields(&fields(&[("quality", "0")])).is_err());
        assert!(ImageOptions::from_fields(&fields(&[("format", "gif")])).is_err());
    }
}

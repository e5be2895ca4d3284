//! Pure Rust image processing backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, TIFF, WebP) | `image` crate (pure Rust decoders) |
//! | Decode (AVIF) | `avif-parse` (container) + `rav1d` (AV1) + BT.601 YUV→RGB |
//! | Identify (AVIF) | `avif-parse` container metadata, no pixel decode |
//! | Render | `DynamicImage::crop_imm` + `resize_exact` with `Lanczos3` |
//! | Encode → JPEG / PNG / ICO | `image::codecs::{jpeg, png, ico}` |
//! | Encode → WebP | `image::codecs::webp::WebPEncoder` (lossless only, quality ignored) |
//! | Encode → AVIF | `image::codecs::avif::AvifEncoder` (rav1e, speed 6) |

use super::backend::{BackendError, Dimensions, ImageBackend};
use super::params::{EncodeParams, OutputFormat, Quality, RenderParams};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use rav1d::include::dav1d::picture::Dav1dPicture;
use std::path::Path;
use std::sync::LazyLock;

/// Extensions whose decoders are compiled in and known to work.
///
/// AVIF is not listed: the `image` crate's `"avif"` feature only enables the
/// **encoder** (rav1e), yet `reading_enabled()` reports true for it. AVIF is
/// decoded by [`decode_avif`] instead and appended separately.
const PHOTO_CANDIDATES: &[(&str, ImageFormat)] = &[
    ("jpg", ImageFormat::Jpeg),
    ("jpeg", ImageFormat::Jpeg),
    ("png", ImageFormat::Png),
    ("tif", ImageFormat::Tiff),
    ("tiff", ImageFormat::Tiff),
    ("webp", ImageFormat::WebP),
];

static SUPPORTED_EXTENSIONS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    PHOTO_CANDIDATES
        .iter()
        .filter(|(_, fmt)| fmt.reading_enabled())
        .map(|(ext, _)| *ext)
        .chain(std::iter::once("avif"))
        .collect()
});

/// Returns the set of image file extensions that have working decoders compiled in.
pub fn supported_input_extensions() -> &'static [&'static str] {
    &SUPPORTED_EXTENSIONS
}

/// Largest edge the ICO container can hold.
pub const ICO_MAX_EDGE: u32 = 256;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn is_avif(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("avif"))
}

/// Load and decode an image from disk.
pub(crate) fn load_image(path: &Path) -> Result<DynamicImage, BackendError> {
    if is_avif(path) {
        return decode_avif(path);
    }
    ImageReader::open(path)
        .map_err(BackendError::Io)?
        .with_guessed_format()
        .map_err(BackendError::Io)?
        .decode()
        .map_err(|e| {
            BackendError::ProcessingFailed(format!("Failed to decode {}: {}", path.display(), e))
        })
}

fn read_avif(path: &Path) -> Result<avif_parse::AvifData, BackendError> {
    let file_data = std::fs::read(path).map_err(BackendError::Io)?;
    avif_parse::read_avif(&mut std::io::Cursor::new(&file_data)).map_err(|e| {
        BackendError::ProcessingFailed(format!("Failed to parse AVIF {}: {e:?}", path.display()))
    })
}

/// Extract dimensions from an AVIF file's container metadata (no full decode needed).
fn identify_avif(path: &Path) -> Result<Dimensions, BackendError> {
    let avif = read_avif(path)?;
    let meta = avif.primary_item_metadata().map_err(|e| {
        BackendError::ProcessingFailed(format!(
            "Failed to read AVIF metadata {}: {e:?}",
            path.display()
        ))
    })?;
    Ok(Dimensions {
        width: meta.max_frame_width.get(),
        height: meta.max_frame_height.get(),
    })
}

/// Decode an AVIF still: `avif-parse` pulls the AV1 payload out of the
/// container, `rav1d` decodes it to YUV planes.
fn decode_avif(path: &Path) -> Result<DynamicImage, BackendError> {
    let avif = read_avif(path)?;
    decode_av1(&avif.primary_item).map_err(|e| {
        BackendError::ProcessingFailed(format!("Failed to decode AVIF {}: {}", path.display(), e))
    })
}

fn decode_av1(payload: &[u8]) -> Result<DynamicImage, String> {
    use rav1d::include::dav1d::data::Dav1dData;
    use rav1d::include::dav1d::dav1d::Dav1dSettings;
    use rav1d::src::lib as dav1d;
    use std::mem::MaybeUninit;
    use std::ptr::NonNull;

    let mut settings = MaybeUninit::<Dav1dSettings>::uninit();
    // SAFETY: dav1d_default_settings initializes every field.
    let mut settings = unsafe {
        dav1d::dav1d_default_settings(NonNull::from(&mut settings).cast());
        settings.assume_init()
    };
    settings.n_threads = 1;
    settings.max_frame_delay = 1;

    let mut ctx = None;
    // SAFETY: both pointers come from live locals.
    let rc = unsafe { dav1d::dav1d_open(NonNull::new(&mut ctx), NonNull::new(&mut settings)) };
    if rc.0 != 0 {
        return Err(format!("decoder open failed ({})", rc.0));
    }

    let decoded = (|| {
        let mut data = Dav1dData::default();
        // SAFETY: the buffer returned by dav1d_data_create holds payload.len() bytes.
        unsafe {
            let buf = dav1d::dav1d_data_create(NonNull::new(&mut data), payload.len());
            if buf.is_null() {
                return Err("data buffer allocation failed".to_string());
            }
            std::ptr::copy_nonoverlapping(payload.as_ptr(), buf, payload.len());
        }
        // SAFETY: ctx was opened above; data is owned by this frame.
        let rc = unsafe { dav1d::dav1d_send_data(ctx, NonNull::new(&mut data)) };
        if rc.0 != 0 {
            unsafe { dav1d::dav1d_data_unref(NonNull::new(&mut data)) };
            return Err(format!("send_data failed ({})", rc.0));
        }

        // SAFETY: an all-zero Dav1dPicture is the documented empty picture.
        let mut pic: Dav1dPicture = unsafe { std::mem::zeroed() };
        let rc = unsafe { dav1d::dav1d_get_picture(ctx, NonNull::new(&mut pic)) };
        if rc.0 != 0 {
            return Err(format!("get_picture failed ({})", rc.0));
        }
        let image = picture_to_rgb(&pic);
        // SAFETY: pic was filled by dav1d_get_picture and is released once.
        unsafe { dav1d::dav1d_picture_unref(NonNull::new(&mut pic)) };
        image
    })();

    // SAFETY: ctx is closed exactly once, after every use above.
    unsafe { dav1d::dav1d_close(NonNull::new(&mut ctx)) };
    decoded
}

/// One YUV plane as handed out by the decoder.
#[derive(Clone, Copy)]
struct Plane {
    ptr: *const u8,
    stride: isize,
    /// Bits per component; above 8 samples are stored as u16.
    bpc: u32,
}

impl Plane {
    fn sample(&self, x: u32, y: u32) -> f32 {
        let row = y as isize * self.stride;
        // SAFETY: callers stay inside the plane's width and height.
        unsafe {
            if self.bpc <= 8 {
                *self.ptr.offset(row + x as isize) as f32
            } else {
                *(self.ptr.offset(row + x as isize * 2) as *const u16) as f32
            }
        }
    }
}

fn picture_to_rgb(pic: &Dav1dPicture) -> Result<DynamicImage, String> {
    use rav1d::include::dav1d::headers::{
        DAV1D_PIXEL_LAYOUT_I400, DAV1D_PIXEL_LAYOUT_I420, DAV1D_PIXEL_LAYOUT_I422,
        DAV1D_PIXEL_LAYOUT_I444,
    };

    let (width, height) = (pic.p.w as u32, pic.p.h as u32);
    let bpc = pic.p.bpc as u32;
    let plane = |i: usize, stride: isize| {
        pic.data[i]
            .map(|p| Plane {
                ptr: p.as_ptr() as *const u8,
                stride,
                bpc,
            })
            .ok_or_else(|| format!("plane {} missing", i))
    };
    let luma = plane(0, pic.stride[0])?;
    let chroma = match pic.p.layout {
        DAV1D_PIXEL_LAYOUT_I400 => None,
        DAV1D_PIXEL_LAYOUT_I420 => Some((true, true)),
        DAV1D_PIXEL_LAYOUT_I422 => Some((true, false)),
        DAV1D_PIXEL_LAYOUT_I444 => Some((false, false)),
        other => return Err(format!("unsupported pixel layout {}", other)),
    };
    let chroma = match chroma {
        Some(subsampling) => Some((
            plane(1, pic.stride[1])?,
            plane(2, pic.stride[1])?,
            subsampling,
        )),
        None => None,
    };

    let scale = 255.0 / ((1u32 << bpc) - 1) as f32;
    let center = (1u32 << (bpc - 1)) as f32;
    let to_u8 = |v: f32| (v * scale).clamp(0.0, 255.0) as u8;
    let rgb = image::RgbImage::from_fn(width, height, |x, y| {
        let luma = luma.sample(x, y);
        let Some((cb, cr, (ss_x, ss_y))) = chroma else {
            let v = to_u8(luma);
            return image::Rgb([v, v, v]);
        };
        let (cx, cy) = (if ss_x { x / 2 } else { x }, if ss_y { y / 2 } else { y });
        let cb = cb.sample(cx, cy) - center;
        let cr = cr.sample(cx, cy) - center;
        image::Rgb([
            to_u8(luma + 1.402 * cr),
            to_u8(luma - 0.344_136 * cb - 0.714_136 * cr),
            to_u8(luma + 1.772 * cb),
        ])
    });
    Ok(DynamicImage::ImageRgb8(rgb))
}

/// Convert to a pixel layout every encoder for `format` accepts.
fn prepare_for(img: DynamicImage, format: OutputFormat, flatten: bool) -> DynamicImage {
    let keep_alpha = format.supports_alpha() && !flatten && img.color().has_alpha();
    if keep_alpha {
        DynamicImage::ImageRgba8(img.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    }
}

/// Encode and write `img` to `path`.
fn save_image(
    img: &DynamicImage,
    path: &Path,
    format: OutputFormat,
    quality: Quality,
) -> Result<(), BackendError> {
    if format == OutputFormat::Ico && (img.width() > ICO_MAX_EDGE || img.height() > ICO_MAX_EDGE) {
        return Err(BackendError::UnsupportedFormat(format!(
            "ICO images are limited to {}px, got {}x{}",
            ICO_MAX_EDGE,
            img.width(),
            img.height()
        )));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path).map_err(BackendError::Io)?;
    let writer = std::io::BufWriter::new(file);
    let q = quality.value() as u8;

    let result = match format {
        OutputFormat::Jpg => img.write_with_encoder(
            image::codecs::jpeg::JpegEncoder::new_with_quality(writer, q),
        ),
        OutputFormat::Png => img.write_with_encoder(image::codecs::png::PngEncoder::new(writer)),
        OutputFormat::Webp => {
            if quality.value() < 100 {
                log::debug!(
                    "{}: webp is encoded lossless, quality {} has no effect",
                    path.display(),
                    quality.value()
                );
            }
            img.write_with_encoder(image::codecs::webp::WebPEncoder::new_lossless(writer))
        }
        OutputFormat::Avif => img.write_with_encoder(
            image::codecs::avif::AvifEncoder::new_with_speed_quality(writer, 6, q),
        ),
        OutputFormat::Ico => img.write_with_encoder(image::codecs::ico::IcoEncoder::new(writer)),
    };
    result.map_err(|e| BackendError::ProcessingFailed(format!("{} encode failed: {}", format, e)))
}

impl ImageBackend for RustBackend {
    fn identify(&self, path: &Path) -> Result<Dimensions, BackendError> {
        if is_avif(path) {
            return identify_avif(path);
        }
        let (width, height) = image::image_dimensions(path).map_err(|e| {
            BackendError::ProcessingFailed(format!("Failed to read dimensions: {}", e))
        })?;
        Ok(Dimensions { width, height })
    }

    fn render(&self, params: &RenderParams) -> Result<(), BackendError> {
        let img = load_image(&params.source)?;
        let rect = params.source_rect;
        if rect.width == 0 || rect.height == 0 || params.width == 0 || params.height == 0 {
            return Err(BackendError::ProcessingFailed(format!(
                "Empty render: {}x{} from {}x{}",
                params.width, params.height, rect.width, rect.height
            )));
        }
        if rect.right() > img.width() || rect.bottom() > img.height() {
            return Err(BackendError::ProcessingFailed(format!(
                "Source rect {}x{}+{}+{} exceeds {}x{} image",
                rect.width,
                rect.height,
                rect.x,
                rect.y,
                img.width(),
                img.height()
            )));
        }

        let region = if rect.x == 0
            && rect.y == 0
            && rect.width == img.width()
            && rect.height == img.height()
        {
            img
        } else {
            img.crop_imm(rect.x, rect.y, rect.width, rect.height)
        };
        let rendered = if region.width() == params.width && region.height() == params.height {
            region
        } else {
            region.resize_exact(params.width, params.height, FilterType::Lanczos3)
        };

        let prepared = prepare_for(rendered, params.format, false);
        save_image(&prepared, &params.output, params.format, params.quality)
    }

    fn encode(&self, params: &EncodeParams) -> Result<(), BackendError> {
        let img = load_image(&params.source)?;
        let prepared = prepare_for(img, params.format, params.flatten);
        save_image(&prepared, &params.output, params.format, params.quality)
    }
}

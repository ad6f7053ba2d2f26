//! Texture data and the material texture array

use crate::backend::*;
use super::upload::UploadError;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbaImage};

/// Decoded RGBA8 texture data
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Decode an encoded image (PNG, JPEG, ...) from memory
    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self, UploadError> {
        let img = image::load_from_memory(bytes)?;
        Ok(Self::from_image(img, name))
    }

    fn from_image(img: DynamicImage, name: &str) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.to_rgba8().into_raw(),
            name: name.to_string(),
        }
    }

    /// Resample to a square `size` x `size` image; no-op when already that size
    pub fn resized(self, size: u32) -> Result<Self, UploadError> {
        if self.width == size && self.height == size {
            return Ok(self);
        }
        let image = RgbaImage::from_raw(self.width, self.height, self.data)
            .ok_or_else(|| UploadError::InvalidData(self.name.clone()))?;
        let resized = image::imageops::resize(&image, size, size, FilterType::Triangle);
        Ok(Self {
            width: size,
            height: size,
            data: resized.into_raw(),
            name: self.name,
        })
    }

    /// Create a solid color texture of the given size
    pub fn solid_color(size: u32, color: [u8; 4], name: &str) -> Self {
        Self {
            width: size,
            height: size,
            data: color.repeat((size * size) as usize),
            name: name.to_string(),
        }
    }

    /// Create a checkerboard texture
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);

        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                data.extend_from_slice(if is_even { &color1 } else { &color2 });
            }
        }

        Self {
            width: size,
            height: size,
            data,
            name: "checkerboard".to_string(),
        }
    }
}

/// Layer indices that always hold a usable default
pub mod default_layers {
    pub const WHITE: u32 = 0;
    /// Tangent-space up (0.5, 0.5, 1.0)
    pub const FLAT_NORMAL: u32 = 1;
    /// Metallic 0, roughness 0.5
    pub const DIELECTRIC: u32 = 2;
    pub const COUNT: u32 = 3;
}

/// One 2D array texture holding every material texture at a fixed resolution.
///
/// Per-instance texture indices in the culling data are layer indices into this
/// array, which lets a single descriptor set serve every draw.
pub struct MaterialTextureArray {
    texture: ImageHandle,
    view: ImageViewHandle,
    sampler: SamplerHandle,
    layer_size: u32,
    layer_count: u32,
}

impl MaterialTextureArray {
    pub fn new(device: &mut dyn Device, layer_size: u32, layer_count: u32) -> BackendResult<Self> {
        if layer_count < default_layers::COUNT {
            return Err(BackendError::InvalidParameter(format!(
                "material array needs at least {} layers, got {}",
                default_layers::COUNT,
                layer_count
            )));
        }

        let texture = device.create_texture(&TextureDescriptor {
            label: Some("material_textures".into()),
            width: layer_size,
            height: layer_size,
            array_layers: layer_count,
            mip_levels: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        })?;
        let view = device.create_texture_view(texture, &TextureViewDescriptor::array())?;
        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("material_sampler".into()),
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::Repeat,
            ..Default::default()
        })?;

        let mut array = Self {
            texture,
            view,
            sampler,
            layer_size,
            layer_count,
        };

        let defaults = [
            (default_layers::WHITE, [255, 255, 255, 255], "white"),
            (default_layers::FLAT_NORMAL, [128, 128, 255, 255], "flat_normal"),
            (default_layers::DIELECTRIC, [0, 128, 0, 255], "dielectric"),
        ];
        for (layer, color, name) in defaults {
            array.upload(device, layer, &TextureData::solid_color(layer_size, color, name))?;
        }

        Ok(array)
    }

    /// Write decoded data into a layer. The data must already be `layer_size` square.
    pub fn upload(&mut self, device: &mut dyn Device, layer: u32, data: &TextureData) -> BackendResult<()> {
        if layer >= self.layer_count {
            return Err(BackendError::InvalidParameter(format!(
                "material layer {} out of range ({} layers)",
                layer, self.layer_count
            )));
        }
        if data.width != self.layer_size || data.height != self.layer_size {
            return Err(BackendError::InvalidParameter(format!(
                "texture '{}' is {}x{}, material layers are {}x{}",
                data.name, data.width, data.height, self.layer_size, self.layer_size
            )));
        }
        device.write_texture(self.texture, layer, &data.data, data.width, data.height);
        Ok(())
    }

    pub fn texture(&self) -> ImageHandle {
        self.texture
    }

    pub fn view(&self) -> ImageViewHandle {
        self.view
    }

    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    pub fn layer_size(&self) -> u32 {
        self.layer_size
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    pub fn destroy(&mut self, device: &mut dyn Device) {
        device.destroy_texture_view(self.view);
        device.destroy_texture(self.texture);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_to_layer_size() {
        let data = TextureData::checkerboard(32, [255, 0, 0, 255], [0, 0, 255, 255]);
        let resized = data.resized(16).unwrap();
        assert_eq!((resized.width, resized.height), (16, 16));
        assert_eq!(resized.data.len(), 16 * 16 * 4);
    }

    #[test]
    fn test_material_array_rejects_wrong_size() {
        let mut device = HeadlessBackend::new();
        let mut array = MaterialTextureArray::new(&mut device, 8, 4).unwrap();
        let wrong = TextureData::solid_color(4, [0; 4], "small");
        assert!(array.upload(&mut device, 3, &wrong).is_err());
        let right = TextureData::solid_color(8, [0; 4], "right");
        assert!(array.upload(&mut device, 3, &right).is_ok());
        assert!(array.upload(&mut device, 4, &right).is_err());
    }
}

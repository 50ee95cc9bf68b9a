use burn::{
    module::Module,
    nn::{
        conv::{Conv3d, Conv3dConfig, ConvTranspose3d, ConvTranspose3dConfig},
        InstanceNorm, InstanceNormConfig, PRelu, PReluConfig, PaddingConfig3d,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::config;
use crate::error::VolsegError;

/// Padding that keeps the spatial size for odd kernels at stride 1
fn same_padding(kernel: usize) -> usize {
    (kernel - 1) / 2
}

/// Convolution followed by instance norm and PReLU (unless `conv_only`)
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv3d<B>,
    norm: Option<InstanceNorm<B>>,
    act: Option<PRelu<B>>,
}

impl<B: Backend> ConvBlock<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        conv_only: bool,
        device: &B::Device,
    ) -> Self {
        let pad = same_padding(kernel);
        let conv = Conv3dConfig::new([in_channels, out_channels], [kernel; 3])
            .with_stride([stride; 3])
            .with_padding(PaddingConfig3d::Explicit(pad, pad, pad))
            .init(device);

        let (norm, act) = if conv_only {
            (None, None)
        } else {
            (
                Some(InstanceNormConfig::new(out_channels).init(device)),
                Some(PReluConfig::new().init(device)),
            )
        };

        Self { conv, norm, act }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.conv.forward(input);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        match &self.act {
            Some(act) => act.forward(x),
            None => x,
        }
    }
}

/// Stack of conv blocks with an additive shortcut.
///
/// The first block carries the stride; the shortcut is a convolution when
/// the stride or channel count changes, identity otherwise.
#[derive(Module, Debug)]
pub struct ResidualUnit<B: Backend> {
    units: Vec<ConvBlock<B>>,
    residual: Option<Conv3d<B>>,
}

impl<B: Backend> ResidualUnit<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        kernel: usize,
        subunits: usize,
        last_conv_only: bool,
        device: &B::Device,
    ) -> Self {
        let mut units = Vec::with_capacity(subunits);
        let mut channels = in_channels;
        let mut unit_stride = stride;
        for su in 0..subunits {
            let conv_only = last_conv_only && su + 1 == subunits;
            units.push(ConvBlock::new(
                channels,
                out_channels,
                kernel,
                unit_stride,
                conv_only,
                device,
            ));
            channels = out_channels;
            unit_stride = 1;
        }

        let residual = if stride != 1 || in_channels != out_channels {
            let rkernel = if stride != 1 { kernel } else { 1 };
            let pad = same_padding(rkernel);
            Some(
                Conv3dConfig::new([in_channels, out_channels], [rkernel; 3])
                    .with_stride([stride; 3])
                    .with_padding(PaddingConfig3d::Explicit(pad, pad, pad))
                    .init(device),
            )
        } else {
            None
        };

        Self { units, residual }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let shortcut = match &self.residual {
            Some(conv) => conv.forward(input.clone()),
            None => input.clone(),
        };
        let x = self
            .units
            .iter()
            .fold(input, |x, unit| unit.forward(x));
        x + shortcut
    }
}

/// Transposed convolution upsampling followed by a refining residual unit
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    conv: ConvTranspose3d<B>,
    norm: InstanceNorm<B>,
    act: PRelu<B>,
    refine: ResidualUnit<B>,
}

impl<B: Backend> UpBlock<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        up_kernel: usize,
        kernel: usize,
        is_top: bool,
        device: &B::Device,
    ) -> Self {
        let pad = same_padding(up_kernel);
        let conv = ConvTranspose3dConfig::new([in_channels, out_channels], [up_kernel; 3])
            .with_stride([stride; 3])
            .with_padding([pad; 3])
            .with_padding_out([stride - 1; 3])
            .init(device);

        Self {
            conv,
            norm: InstanceNormConfig::new(out_channels).init(device),
            act: PReluConfig::new().init(device),
            // the network's final convolution emits raw logits
            refine: ResidualUnit::new(out_channels, out_channels, 1, kernel, 1, is_top, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.conv.forward(input);
        let x = self.act.forward(self.norm.forward(x));
        self.refine.forward(x)
    }
}

/// 3D residual U-Net
///
/// Architecture: strided residual units down, residual bottom unit, transposed
/// convolutions up; each decoder level concatenates the encoder output of the
/// same resolution before upsampling.
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    down: Vec<ResidualUnit<B>>,
    bottom: ResidualUnit<B>,
    up: Vec<UpBlock<B>>,
}

/// Configuration for the model
#[derive(burn::config::Config, Debug)]
pub struct UNetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Feature channels per level, shallowest first; the last entry is the bottom
    pub channels: Vec<usize>,
    /// Downsampling factor between consecutive levels
    pub strides: Vec<usize>,
    #[config(default = 2)]
    pub num_res_units: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 3)]
    pub up_kernel_size: usize,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self::new(
            config::UNET_IN_CHANNELS,
            config::UNET_OUT_CHANNELS,
            config::UNET_CHANNELS.to_vec(),
            config::UNET_STRIDES.to_vec(),
        )
        .with_num_res_units(config::UNET_NUM_RES_UNITS)
    }
}

impl UNetConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.channels.len() < 2 {
            return Err(VolsegError::invalid(
                "UNet needs at least two channel levels",
            ));
        }
        if self.strides.len() != self.channels.len() - 1 {
            return Err(VolsegError::invalid(format!(
                "UNet with {} channel levels needs {} strides, got {}",
                self.channels.len(),
                self.channels.len() - 1,
                self.strides.len()
            )));
        }
        if self.in_channels == 0
            || self.out_channels == 0
            || self.channels.contains(&0)
            || self.strides.contains(&0)
        {
            return Err(VolsegError::invalid("UNet channels and strides must be positive"));
        }
        if self.num_res_units == 0 {
            return Err(VolsegError::invalid("UNet needs at least one residual unit"));
        }
        if self.kernel_size % 2 == 0 || self.up_kernel_size % 2 == 0 {
            return Err(VolsegError::invalid("UNet kernel sizes must be odd"));
        }
        Ok(())
    }

    /// Spatial sizes fed to the network must be multiples of this
    pub fn size_divisor(&self) -> usize {
        self.strides.iter().product()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<UNet<B>> {
        self.validate()?;
        let levels = self.strides.len();

        let down = (0..levels)
            .map(|k| {
                let in_channels = if k == 0 {
                    self.in_channels
                } else {
                    self.channels[k - 1]
                };
                ResidualUnit::new(
                    in_channels,
                    self.channels[k],
                    self.strides[k],
                    self.kernel_size,
                    self.num_res_units,
                    false,
                    device,
                )
            })
            .collect();

        let bottom = ResidualUnit::new(
            self.channels[levels - 1],
            self.channels[levels],
            1,
            self.kernel_size,
            self.num_res_units,
            false,
            device,
        );

        let up = (0..levels)
            .map(|k| {
                // skip features concatenated with the level below
                let in_channels = if k == levels - 1 {
                    self.channels[k] + self.channels[k + 1]
                } else {
                    self.channels[k] * 2
                };
                let out_channels = if k == 0 {
                    self.out_channels
                } else {
                    self.channels[k - 1]
                };
                UpBlock::new(
                    in_channels,
                    out_channels,
                    self.strides[k],
                    self.up_kernel_size,
                    self.kernel_size,
                    k == 0,
                    device,
                )
            })
            .collect();

        Ok(UNet { down, bottom, up })
    }
}

impl<B: Backend> UNet<B> {
    /// Forward pass
    ///
    /// Input shape: [batch_size, in_channels, x, y, z]
    /// Output shape: [batch_size, out_channels, x, y, z] (logits)
    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let mut skips = Vec::with_capacity(self.down.len());
        let mut x = input;
        for down in &self.down {
            x = down.forward(x);
            skips.push(x.clone());
        }

        x = self.bottom.forward(x);

        for (up, skip) in self.up.iter().zip(skips).rev() {
            x = up.forward(Tensor::cat(vec![skip, x], 1));
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CpuBackend as TestBackend;

    fn tiny_config() -> UNetConfig {
        UNetConfig::new(1, 2, vec![2, 4, 4], vec![2, 2]).with_num_res_units(1)
    }

    #[test]
    fn test_forward_keeps_spatial_shape() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device).unwrap();

        let input = Tensor::<TestBackend, 5>::random(
            [2, 1, 8, 8, 4],
            burn::tensor::Distribution::Default,
            &device,
        );
        let output = model.forward(input);

        assert_eq!(output.dims(), [2, 2, 8, 8, 4]);
    }

    #[test]
    fn test_default_config_matches_pipeline() {
        let config = UNetConfig::default();
        assert_eq!(config.channels, vec![16, 32, 64, 128, 256]);
        assert_eq!(config.num_res_units, 2);
        assert_eq!(config.size_divisor(), 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let device = Default::default();

        let bad_strides = UNetConfig::new(1, 1, vec![4, 8, 16], vec![2]);
        assert!(bad_strides.init::<TestBackend>(&device).is_err());

        let one_level = UNetConfig::new(1, 1, vec![4], vec![]);
        assert!(one_level.validate().is_err());

        let no_res = tiny_config().with_num_res_units(0);
        assert!(no_res.validate().is_err());

        let even_kernel = tiny_config().with_kernel_size(4);
        assert!(even_kernel.validate().is_err());
    }
}

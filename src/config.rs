/// Sliding-window region of interest (voxels per spatial axis)
pub const ROI_SIZE: [usize; 3] = [96, 96, 96];

/// Number of windows handed to the model per forward pass
pub const SW_BATCH_SIZE: usize = 4;

/// U-Net configuration
pub const UNET_IN_CHANNELS: usize = 1;
pub const UNET_OUT_CHANNELS: usize = 1;
pub const UNET_CHANNELS: &[usize] = &[16, 32, 64, 128, 256];
pub const UNET_STRIDES: &[usize] = &[2, 2, 2, 2];
pub const UNET_NUM_RES_UNITS: usize = 2;

/// Synthetic data generation
pub const SYNTH_NUM_VOLUMES: usize = 5;
pub const SYNTH_VOLUME_SIZE: usize = 128;
pub const SYNTH_NUM_OBJS: usize = 12;
pub const SYNTH_RAD_MAX: usize = 30;
pub const SYNTH_SEG_CLASSES: usize = 1;
pub const SYNTH_SEED: u64 = 0;

/// Default checkpoint location (the recorder appends `.mpk.gz`)
pub const DEFAULT_CHECKPOINT: &str = "./runs/net_checkpoint_50";

/// Where predicted segmentations are written
pub const DEFAULT_OUTPUT_DIR: &str = "./tempdir";
pub const OUTPUT_POSTFIX: &str = "seg";
pub const OUTPUT_EXT: &str = ".nii.gz";

/// Name under which the mean Dice score is reported
pub const MEAN_DICE_NAME: &str = "Mean_Dice";

/// Binarisation threshold applied after the sigmoid when computing Dice
pub const DICE_LOGIT_THRESH: f64 = 0.5;

/// Data loader worker threads
pub const LOADER_NUM_WORKERS: usize = 1;

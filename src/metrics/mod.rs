pub mod dice;

pub use dice::{compute_meandice, DiceConfig, MeanDice};

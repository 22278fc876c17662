//! Native audio output for the tutor: WAV decoding, resampling and cpal playback.
pub mod audio;
pub mod device;
pub mod playback;

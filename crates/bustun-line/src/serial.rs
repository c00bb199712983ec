//! Line driver for an external clocked transceiver on a serial device.
//!
//! The transceiver samples the bus on every clock edge and hands the
//! bitstream over as packed bytes, most significant bit first; in the
//! other direction it clocks out the two-bit wire symbols the emitter
//! produces. A dedicated thread feeds received bytes into the bit pump,
//! playing the role the receive interrupt has on the reference hardware.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bustun_common::{dev_error, dev_warn};
use bustun_link::rx::{BitPump, PumpEvents};
use bustun_link::shared::LineShared;
use bustun_link::tx::{
    FLAG_STREAM_CAP, FLAG_STREAM_COUNT, LineTx, LineTxError, encode_flag_stream,
};
use serial2::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};

pub struct SerialLine {
    port: Arc<SerialPort>,
    shared: OnceLock<Arc<LineShared>>,
    flag_bits: Vec<u8>,
    primer_staged: AtomicBool,
}

impl SerialLine {
    pub fn open(path: &str, baud_rate: u32) -> std::io::Result<Arc<Self>> {
        let mut port = SerialPort::open(path, |mut settings: Settings| {
            settings.set_raw();
            settings.set_baud_rate(baud_rate)?;
            settings.set_char_size(CharSize::Bits8);
            settings.set_parity(Parity::None);
            settings.set_stop_bits(StopBits::One);
            settings.set_flow_control(FlowControl::None);
            Ok(settings)
        })?;
        port.set_read_timeout(Duration::from_millis(50))?;

        let flag_bits = encode_flag_stream::<FLAG_STREAM_CAP>(FLAG_STREAM_COUNT)
            .expect("flag stream fits its capacity")
            .to_vec();

        Ok(Arc::new(Self {
            port: Arc::new(port),
            shared: OnceLock::new(),
            flag_bits,
            primer_staged: AtomicBool::new(false),
        }))
    }

    /// Connects the driver to its link's shared line state. Must be
    /// called before traffic flows.
    pub fn attach(&self, shared: Arc<LineShared>) {
        let _ = self.shared.set(shared);
    }

    fn set_tx(&self, active: bool) {
        if let Some(shared) = self.shared.get() {
            shared.set_tx_in_progress(active);
        }
    }

    /// Starts the receive thread clocking sampled bytes into `pump`.
    pub fn spawn_rx<E>(
        self: &Arc<Self>,
        mut pump: BitPump<E>,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()>
    where
        E: PumpEvents + Send + 'static,
    {
        let port = Arc::clone(&self.port);
        thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || {
                let mut buf = [0u8; 256];
                while !stop.load(Ordering::Relaxed) {
                    match (&*port).read(&mut buf) {
                        Ok(0) => {}
                        Ok(n) => {
                            for &byte in &buf[..n] {
                                pump.clock_byte(byte);
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::TimedOut => {}
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => {
                            dev_error!("Serial read failed: {}", e);
                            break;
                        }
                    }
                }
            })
            .expect("spawn serial rx thread")
    }

    fn write_all(&self, bits: &[u8]) -> Result<(), LineTxError> {
        (&*self.port).write_all(bits).map_err(|e| {
            dev_error!("Serial write failed: {}", e);
            LineTxError::Device
        })
    }
}

impl LineTx for SerialLine {
    fn submit(&self, bits: &[u8]) -> Result<(), LineTxError> {
        self.set_tx(true);
        self.write_all(bits)
    }

    fn wait_done(&self) {
        if let Err(e) = (&*self.port).flush() {
            dev_warn!("Serial flush failed: {}", e);
        }
        self.set_tx(false);
    }

    fn prequeue_flag_stream(&self) {
        self.primer_staged.store(true, Ordering::Relaxed);
    }

    fn pre_go(&self) {
        self.set_tx(true);
        // A kernel write can stall briefly; tolerated here because this
        // driver's "interrupt context" is an ordinary thread.
        if self.primer_staged.swap(false, Ordering::Relaxed) {
            let _ = self.write_all(&self.flag_bits);
        }
    }
}

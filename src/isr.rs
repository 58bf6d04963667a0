//! Interrupt plumbing for the receiver engine.
//!
//! Decoders usually tick the receiver from an interrupt (SPI byte-complete
//! or a clock edge) while the main loop keeps running the sound engine.
//! The macros here wrap [`rx::Driver`](crate::rx::Driver) in a
//! `critical_section::Mutex` so both contexts can reach it safely:
//!
//! - [`init_rx_driver!`](crate::init_rx_driver): declares the static
//!   singleton for a concrete HAL type
//! - [`setup_rx_driver!`](crate::setup_rx_driver): stores a driver instance
//!   in it
//! - [`service_rx_driver!`](crate::service_rx_driver): advances the engine
//!   by one transition, safe to call from an ISR before setup

/// Declares a static `RX_DRIVER` singleton protected by a
/// `critical_section` mutex.
///
/// # Arguments
/// - `$hal`: the concrete type implementing [`rx::Hal`](crate::rx::Hal)
///
/// # Example
/// ```rust,ignore
/// init_rx_driver!(MyDecoderHal);
/// ```
#[macro_export]
macro_rules! init_rx_driver {
    ( $hal:ty ) => {
        pub static RX_DRIVER: $crate::critical_section::Mutex<
            core::cell::RefCell<Option<$crate::rx::Driver<$hal>>>,
        > = $crate::critical_section::Mutex::new(core::cell::RefCell::new(None));
    };
}

/// Stores a driver instance in the `RX_DRIVER` singleton declared by
/// [`init_rx_driver!`](crate::init_rx_driver).
///
/// # Arguments
/// - `$hal`: the HAL value handed to [`rx::Driver::new`](crate::rx::Driver::new)
///
/// # Example
/// ```rust,ignore
/// fn main() {
///     setup_rx_driver!(MyDecoderHal::new(spi1, flash));
/// }
/// ```
#[macro_export]
macro_rules! setup_rx_driver {
    ( $hal:expr ) => {
        $crate::critical_section::with(|cs| {
            let _ = RX_DRIVER
                .borrow(cs)
                .replace(Some($crate::rx::Driver::new($hal)));
        });
    };
}

/// Advances the `RX_DRIVER` singleton by one state transition.
///
/// Does nothing while the driver has not been set up yet, so it is safe to
/// enable the interrupt first.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn SPI1() {
///     service_rx_driver!();
/// }
/// ```
#[macro_export]
macro_rules! service_rx_driver {
    () => {
        $crate::critical_section::with(|cs| {
            if let Some(driver) = RX_DRIVER.borrow(cs).borrow_mut().as_mut() {
                driver.tick();
            }
        });
    };
}

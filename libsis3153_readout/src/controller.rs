use super::error::ControllerError;

/// Transport and register access of a SIS3153.
///
/// The readout worker only talks to the hardware through this trait. A
/// network implementation lives outside this crate; [`crate::replay::ReplayController`]
/// feeds recorded datagrams back in.
pub trait Controller {
    fn read_register(&mut self, address: u32) -> Result<u32, ControllerError>;

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), ControllerError>;

    /// Receive one datagram into `buffer`. Blocks up to the socket timeout.
    /// `Ok(0)` means nothing arrived, which is not an error.
    fn receive_datagram(&mut self, buffer: &mut [u8]) -> Result<usize, ControllerError>;

    /// Write a stack list into stack RAM at `load_address`
    fn upload_stack_list(&mut self, load_address: u32, words: &[u32]) -> Result<(), ControllerError>;

    fn set_jumbo_frames(&mut self, enable: bool) -> Result<(), ControllerError>;
}

impl<C: Controller + ?Sized> Controller for Box<C> {
    fn read_register(&mut self, address: u32) -> Result<u32, ControllerError> {
        (**self).read_register(address)
    }

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), ControllerError> {
        (**self).write_register(address, value)
    }

    fn receive_datagram(&mut self, buffer: &mut [u8]) -> Result<usize, ControllerError> {
        (**self).receive_datagram(buffer)
    }

    fn upload_stack_list(&mut self, load_address: u32, words: &[u32]) -> Result<(), ControllerError> {
        (**self).upload_stack_list(load_address, words)
    }

    fn set_jumbo_frames(&mut self, enable: bool) -> Result<(), ControllerError> {
        (**self).set_jumbo_frames(enable)
    }
}

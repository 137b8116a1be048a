use ember_x86::Width;

/// Width-aware I/O port dispatch, owned by the device layer.
pub trait PortIo {
    fn io_read(&mut self, port: u16, width: Width) -> u32;
    fn io_write(&mut self, port: u16, width: Width, value: u32);
}

impl<T: PortIo + ?Sized> PortIo for &mut T {
    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        (**self).io_read(port, width)
    }

    fn io_write(&mut self, port: u16, width: Width, value: u32) {
        (**self).io_write(port, width, value)
    }
}

/// No devices: reads float high, writes are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPorts;

impl PortIo for NullPorts {
    fn io_read(&mut self, _port: u16, width: Width) -> u32 {
        width.mask()
    }

    fn io_write(&mut self, _port: u16, _width: Width, _value: u32) {}
}

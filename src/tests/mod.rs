mod fifo_accounting;
mod ring_buffer;

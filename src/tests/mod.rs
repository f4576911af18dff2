//! Integration tests that drive the full runtime, tick by tick, against
//! scripted transports.

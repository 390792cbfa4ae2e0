pub mod portal_wire;
